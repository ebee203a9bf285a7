//! A scriptable simulated BMS node
//!
//! Implements enough of the device's SDO server to exercise the client end to end: expedited and
//! segmented transfers, the block download protocol with per-block acknowledgment, the program
//! object (0x1F50), and fault injection hooks for the failure paths the client must handle.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bmscan_common::{
    constants::{object_ids, program_subs, values},
    dictionary::Access,
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId, CanMessage,
};
use crc16::CrcType as _;

use crate::sim_bus::{SimBus, SimBusReceiver, SimBusSender};

const DEFAULT_BLKSIZE: u8 = 127;

#[derive(Debug, Clone)]
struct Object {
    data: Vec<u8>,
    access: Access,
}

#[derive(Debug, Default)]
struct Faults {
    /// Answer expedited uploads with n=3 regardless of width, like the real firmware
    force_expedited_n3: bool,
    /// Send one upload segment with an inverted toggle bit
    wrong_toggle_once: bool,
    /// Send upload segments as full 7-byte frames claiming no unused bytes; the client must rely
    /// on the declared transfer size to drop the padding
    pad_upload_segments: bool,
    /// Silently drop initiate requests addressing this index
    ignore_index: Option<u16>,
    /// Acknowledge at most this many segments on the next block ack
    ack_short_once: Option<u8>,
    /// Abort with this code once this many transfer bytes have been accepted
    abort_after_bytes: Option<(usize, u32)>,
    /// Abort the end-of-block request with this code
    abort_on_end: Option<u32>,
    /// Delay before sending each block ack
    ack_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct ProgramArea {
    data: Vec<u8>,
    control_log: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    node_id: u8,
    objects: Mutex<HashMap<(u16, u8), Object>>,
    program: Mutex<ProgramArea>,
    faults: Mutex<Faults>,
    received_aborts: Mutex<Vec<(u16, u8, u32)>>,
    blksize: Mutex<u8>,
}

fn default_objects() -> HashMap<(u16, u8), Object> {
    let mut objects = HashMap::new();
    let mut add = |index: u16, sub: u8, data: Vec<u8>, access: Access| {
        objects.insert((index, sub), Object { data, access });
    };
    add(0x1000, 0, 0u32.to_le_bytes().to_vec(), Access::Ro);
    add(0x1008, 0, b"Epsilon V2 BMS".to_vec(), Access::Ro);
    add(0x1017, 0, 1000u16.to_le_bytes().to_vec(), Access::Rw);
    add(0x1018, 1, 0x0000_037Cu32.to_le_bytes().to_vec(), Access::Ro);
    add(0x1018, 2, 0x0000_000Au32.to_le_bytes().to_vec(), Access::Ro);
    add(0x1018, 3, 0x0001_0002u32.to_le_bytes().to_vec(), Access::Ro);
    add(0x1018, 4, 0x1234_5678u32.to_le_bytes().to_vec(), Access::Ro);
    add(0x6060, 0, 55296i32.to_le_bytes().to_vec(), Access::Ro);
    add(0x6081, 0, vec![87], Access::Ro);
    add(0x6010, 0, 201i16.to_le_bytes().to_vec(), Access::Ro);
    add(0x6020, 0, 225i16.to_le_bytes().to_vec(), Access::Ro);
    add(0x6050, 0, 321u16.to_le_bytes().to_vec(), Access::Ro);
    add(0x6051, 0, (-16i16).to_le_bytes().to_vec(), Access::Ro);
    add(0x6052, 0, 24i16.to_le_bytes().to_vec(), Access::Ro);
    add(0x6053, 0, 8000i32.to_le_bytes().to_vec(), Access::Ro);
    add(0x2010, 0, (-2500i32).to_le_bytes().to_vec(), Access::Ro);
    add(object_ids::PROGRAM, program_subs::DATA, vec![], Access::Wo);
    add(object_ids::PROGRAM, program_subs::CONTROL, vec![], Access::Wo);
    objects
}

/// Handle to a spawned simulated node
#[derive(Debug, Clone)]
pub struct SimBms {
    state: Arc<SimState>,
}

impl SimBms {
    /// Spawn a simulated node listening on the bus
    pub fn spawn(node_id: u8, bus: &SimBus) -> SimBms {
        let state = Arc::new(SimState {
            node_id,
            objects: Mutex::new(default_objects()),
            program: Mutex::new(ProgramArea::default()),
            faults: Mutex::new(Faults::default()),
            received_aborts: Mutex::new(Vec::new()),
            blksize: Mutex::new(DEFAULT_BLKSIZE),
        });
        let receiver = bus.new_receiver();
        let sender = bus.new_sender();
        let task_state = state.clone();
        tokio::spawn(async move {
            Server::new(task_state, sender).run(receiver).await;
        });
        SimBms { state }
    }

    /// Replace an object's value and access mode
    pub fn set_object(&self, index: u16, sub: u8, data: Vec<u8>, access: Access) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert((index, sub), Object { data, access });
    }

    /// Get an object's current value
    pub fn object(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.state
            .objects
            .lock()
            .unwrap()
            .get(&(index, sub))
            .map(|o| o.data.clone())
    }

    /// Get the program flash area content
    pub fn program_data(&self) -> Vec<u8> {
        self.state.program.lock().unwrap().data.clone()
    }

    /// Get the sequence of values written to the program control object
    pub fn control_log(&self) -> Vec<u8> {
        self.state.program.lock().unwrap().control_log.clone()
    }

    /// Get the abort frames received from the client as (index, sub, code)
    pub fn received_aborts(&self) -> Vec<(u16, u8, u32)> {
        self.state.received_aborts.lock().unwrap().clone()
    }

    /// Set the block size offered in block download negotiations
    pub fn set_blksize(&self, blksize: u8) {
        *self.state.blksize.lock().unwrap() = blksize;
    }

    /// Answer expedited uploads with n=3 regardless of width, like the real firmware
    pub fn set_force_expedited_n3(&self, enable: bool) {
        self.state.faults.lock().unwrap().force_expedited_n3 = enable;
    }

    /// Send one upload segment with an inverted toggle bit
    pub fn set_wrong_toggle_once(&self) {
        self.state.faults.lock().unwrap().wrong_toggle_once = true;
    }

    /// Pad upload segments to 7 claimed-valid bytes, leaving size-based truncation to the client
    pub fn set_pad_upload_segments(&self, enable: bool) {
        self.state.faults.lock().unwrap().pad_upload_segments = enable;
    }

    /// Silently drop initiate requests addressing `index`
    pub fn set_ignore_index(&self, index: Option<u16>) {
        self.state.faults.lock().unwrap().ignore_index = index;
    }

    /// Acknowledge at most `ackseq` segments on the next block ack
    pub fn set_ack_short_once(&self, ackseq: u8) {
        self.state.faults.lock().unwrap().ack_short_once = Some(ackseq);
    }

    /// Abort with `code` once `bytes` transfer bytes have been accepted
    pub fn set_abort_after_bytes(&self, bytes: usize, code: u32) {
        self.state.faults.lock().unwrap().abort_after_bytes = Some((bytes, code));
    }

    /// Abort the end-of-block request with `code`
    pub fn set_abort_on_end(&self, code: u32) {
        self.state.faults.lock().unwrap().abort_on_end = Some(code);
    }

    /// Delay each block ack by `delay`
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state.faults.lock().unwrap().ack_delay = Some(delay);
    }
}

#[derive(Debug)]
struct Block {
    index: u16,
    sub: u8,
    cc: bool,
    committed: Vec<u8>,
    pending: Vec<u8>,
    next_expect: u8,
    last_flag_at: Option<u8>,
    blksize: u8,
}

#[derive(Debug)]
enum Session {
    Idle,
    UploadSegmented {
        index: u16,
        sub: u8,
        data: Vec<u8>,
        offset: usize,
        toggle: bool,
    },
    DownloadSegmented {
        index: u16,
        sub: u8,
        buf: Vec<u8>,
        toggle: bool,
    },
    BlockDownload(Block),
    BlockEnd(Block),
}

struct Server {
    state: Arc<SimState>,
    sender: SimBusSender,
    resp_id: CanId,
    session: Session,
}

impl Server {
    fn new(state: Arc<SimState>, sender: SimBusSender) -> Self {
        let resp_id = CanId::Std(0x580 + state.node_id as u16);
        Self {
            state,
            sender,
            resp_id,
            session: Session::Idle,
        }
    }

    async fn run(mut self, mut receiver: SimBusReceiver) {
        let req_id = CanId::Std(0x600 + self.state.node_id as u16);
        while let Ok(msg) = receiver.recv().await {
            if msg.id() != req_id {
                continue;
            }
            if let Some(response) = self.handle_frame(msg).await {
                let frame = response.to_can_message(self.resp_id);
                if self.sender.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn handle_frame(&mut self, msg: CanMessage) -> Option<SdoResponse> {
        // Block segments carry no command specifier, so they are parsed by state, not by byte.
        // An abort (0x80) would parse as segment 0, which is never a valid sequence number.
        if matches!(self.session, Session::BlockDownload(_)) && msg.data[0] & 0x7f != 0 {
            let request = SdoRequest::parse_block_segment(msg.data()).ok()?;
            return self.handle_block_segment(request).await;
        }

        let request = match SdoRequest::try_from(msg.data()) {
            Ok(request) => request,
            Err(_) => {
                self.session = Session::Idle;
                return Some(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier));
            }
        };

        if let SdoRequest::Abort {
            index,
            sub,
            abort_code,
        } = request
        {
            self.state
                .received_aborts
                .lock()
                .unwrap()
                .push((index, sub, abort_code));
            self.session = Session::Idle;
            return None;
        }

        if let Some(ignored) = self.state.faults.lock().unwrap().ignore_index {
            let addressed = match request {
                SdoRequest::InitiateUpload { index, .. }
                | SdoRequest::InitiateDownload { index, .. }
                | SdoRequest::InitiateBlockDownload { index, .. } => Some(index),
                _ => None,
            };
            if addressed == Some(ignored) {
                return None;
            }
        }

        match std::mem::replace(&mut self.session, Session::Idle) {
            Session::Idle => self.handle_idle(request),
            Session::UploadSegmented {
                index,
                sub,
                data,
                offset,
                toggle,
            } => self.handle_upload_segmented(request, index, sub, data, offset, toggle),
            Session::DownloadSegmented {
                index,
                sub,
                buf,
                toggle,
            } => self.handle_download_segmented(request, index, sub, buf, toggle),
            Session::BlockDownload(block) => {
                // Only an abort lands here (segments were routed above)
                self.session = Session::BlockDownload(block);
                None
            }
            Session::BlockEnd(block) => self.handle_block_end(request, block).await,
        }
    }

    fn handle_idle(&mut self, request: SdoRequest) -> Option<SdoResponse> {
        match request {
            SdoRequest::InitiateUpload { index, sub } => self.handle_upload(index, sub),
            SdoRequest::InitiateDownload {
                n,
                e,
                s: _,
                index,
                sub,
                data,
            } => {
                if e {
                    let len = 4 - n as usize;
                    match self.write_object(index, sub, &data[..len]) {
                        Ok(()) => Some(SdoResponse::download_acknowledge(index, sub)),
                        Err(code) => Some(SdoResponse::abort(index, sub, code)),
                    }
                } else {
                    if let Err(code) = self.check_writable(index, sub) {
                        return Some(SdoResponse::abort(index, sub, code));
                    }
                    self.session = Session::DownloadSegmented {
                        index,
                        sub,
                        buf: Vec::new(),
                        toggle: false,
                    };
                    Some(SdoResponse::download_acknowledge(index, sub))
                }
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s: _,
                index,
                sub,
                size: _,
            } => {
                if let Err(code) = self.check_writable(index, sub) {
                    return Some(SdoResponse::abort(index, sub, code));
                }
                let blksize = *self.state.blksize.lock().unwrap();
                self.session = Session::BlockDownload(Block {
                    index,
                    sub,
                    cc,
                    committed: Vec::new(),
                    pending: Vec::new(),
                    next_expect: 1,
                    last_flag_at: None,
                    blksize,
                });
                Some(SdoResponse::block_download_acknowledge(
                    true, index, sub, blksize,
                ))
            }
            _ => Some(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier)),
        }
    }

    fn handle_upload(&mut self, index: u16, sub: u8) -> Option<SdoResponse> {
        let object = {
            let objects = self.state.objects.lock().unwrap();
            match objects.get(&(index, sub)) {
                Some(object) => object.clone(),
                None => {
                    let code = if objects.keys().any(|(i, _)| *i == index) {
                        AbortCode::NoSuchSubIndex
                    } else {
                        AbortCode::NoSuchObject
                    };
                    return Some(SdoResponse::abort(index, sub, code));
                }
            }
        };
        if !object.access.is_readable() {
            return Some(SdoResponse::abort(index, sub, AbortCode::WriteOnly));
        }

        if object.data.len() <= 4 {
            let mut n = 4 - object.data.len() as u8;
            if self.state.faults.lock().unwrap().force_expedited_n3 {
                n = 3;
            }
            let mut data = [0u8; 4];
            data[..object.data.len()].copy_from_slice(&object.data);
            Some(SdoResponse::ConfirmUpload {
                n,
                e: true,
                s: true,
                index,
                sub,
                data,
            })
        } else {
            let size = object.data.len() as u32;
            self.session = Session::UploadSegmented {
                index,
                sub,
                data: object.data,
                offset: 0,
                toggle: false,
            };
            Some(SdoResponse::upload_acknowledge(index, sub, size))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_upload_segmented(
        &mut self,
        request: SdoRequest,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        offset: usize,
        toggle: bool,
    ) -> Option<SdoResponse> {
        match request {
            SdoRequest::ReqUploadSegment { t } => {
                if t != toggle {
                    return Some(SdoResponse::abort(
                        index,
                        sub,
                        AbortCode::ToggleNotAlternated,
                    ));
                }
                let seg_len = (data.len() - offset).min(7);
                let complete = offset + seg_len == data.len();
                let mut resp_toggle = t;
                let pad_segments;
                {
                    let mut faults = self.state.faults.lock().unwrap();
                    if faults.wrong_toggle_once {
                        faults.wrong_toggle_once = false;
                        resp_toggle = !t;
                    }
                    pad_segments = faults.pad_upload_segments;
                }
                let response = if pad_segments {
                    let mut padded = [0u8; 7];
                    padded[..seg_len].copy_from_slice(&data[offset..offset + seg_len]);
                    SdoResponse::upload_segment(resp_toggle, complete, &padded)
                } else {
                    SdoResponse::upload_segment(
                        resp_toggle,
                        complete,
                        &data[offset..offset + seg_len],
                    )
                };
                if !complete {
                    self.session = Session::UploadSegmented {
                        index,
                        sub,
                        data,
                        offset: offset + seg_len,
                        toggle: !toggle,
                    };
                }
                Some(response)
            }
            _ => Some(SdoResponse::abort(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
            )),
        }
    }

    fn handle_download_segmented(
        &mut self,
        request: SdoRequest,
        index: u16,
        sub: u8,
        mut buf: Vec<u8>,
        toggle: bool,
    ) -> Option<SdoResponse> {
        match request {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != toggle {
                    return Some(SdoResponse::abort(
                        index,
                        sub,
                        AbortCode::ToggleNotAlternated,
                    ));
                }
                buf.extend_from_slice(&data[..7 - n as usize]);
                if c {
                    match self.write_object(index, sub, &buf) {
                        Ok(()) => Some(SdoResponse::download_segment_acknowledge(t)),
                        Err(code) => Some(SdoResponse::abort(index, sub, code)),
                    }
                } else {
                    self.session = Session::DownloadSegmented {
                        index,
                        sub,
                        buf,
                        toggle: !toggle,
                    };
                    Some(SdoResponse::download_segment_acknowledge(t))
                }
            }
            _ => Some(SdoResponse::abort(
                index,
                sub,
                AbortCode::InvalidCommandSpecifier,
            )),
        }
    }

    async fn handle_block_segment(&mut self, request: SdoRequest) -> Option<SdoResponse> {
        let SdoRequest::BlockSegment { seqno, last, data } = request else {
            return None;
        };
        let Session::BlockDownload(mut block) =
            std::mem::replace(&mut self.session, Session::Idle)
        else {
            return None;
        };

        if seqno == block.next_expect {
            block.pending.extend_from_slice(&data);
            if last {
                block.last_flag_at = Some(seqno);
            }
            block.next_expect += 1;
        }
        // Out-of-sequence segments are discarded; the ack tells the client where to resume

        let received = block.next_expect - 1;
        let block_complete = received > 0
            && (received == block.blksize || block.last_flag_at == Some(received));
        if !block_complete {
            self.session = Session::BlockDownload(block);
            return None;
        }

        let ack_delay = self.state.faults.lock().unwrap().ack_delay;
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }

        let mut ackseq = received;
        {
            let mut faults = self.state.faults.lock().unwrap();
            if let Some(short) = faults.ack_short_once.take() {
                ackseq = ackseq.min(short);
            }
        }

        block
            .committed
            .extend_from_slice(&block.pending[..ackseq as usize * 7]);

        let abort_after = self.state.faults.lock().unwrap().abort_after_bytes;
        if let Some((threshold, code)) = abort_after {
            if block.committed.len() >= threshold {
                self.session = Session::Idle;
                let (index, sub) = (block.index, block.sub);
                let code = AbortCode::try_from(code).unwrap_or(AbortCode::GeneralError);
                return Some(SdoResponse::abort(index, sub, code));
            }
        }

        let done = block.last_flag_at.is_some_and(|pos| pos <= ackseq);
        let response = SdoResponse::block_acknowledge(ackseq, block.blksize);
        if done {
            self.session = Session::BlockEnd(block);
        } else {
            block.pending.clear();
            block.next_expect = 1;
            block.last_flag_at = None;
            self.session = Session::BlockDownload(block);
        }
        Some(response)
    }

    async fn handle_block_end(
        &mut self,
        request: SdoRequest,
        block: Block,
    ) -> Option<SdoResponse> {
        match request {
            SdoRequest::EndBlockDownload { n, crc } => {
                if let Some(code) = self.state.faults.lock().unwrap().abort_on_end.take() {
                    let code = AbortCode::try_from(code).unwrap_or(AbortCode::GeneralError);
                    return Some(SdoResponse::abort(block.index, block.sub, code));
                }
                let mut data = block.committed;
                data.truncate(data.len().saturating_sub(n as usize));
                if block.cc {
                    let crc_calc =
                        crc16::XMODEM::get(crc16::XMODEM::update(crc16::XMODEM::init(), &data));
                    if crc_calc != crc {
                        return Some(SdoResponse::abort(
                            block.index,
                            block.sub,
                            AbortCode::CrcError,
                        ));
                    }
                }
                match self.write_object(block.index, block.sub, &data) {
                    Ok(()) => Some(SdoResponse::ConfirmBlockDownloadEnd),
                    Err(code) => Some(SdoResponse::abort(block.index, block.sub, code)),
                }
            }
            _ => Some(SdoResponse::abort(
                block.index,
                block.sub,
                AbortCode::InvalidCommandSpecifier,
            )),
        }
    }

    fn check_writable(&self, index: u16, sub: u8) -> Result<(), AbortCode> {
        let objects = self.state.objects.lock().unwrap();
        match objects.get(&(index, sub)) {
            Some(object) => {
                if object.access.is_writable() {
                    Ok(())
                } else {
                    Err(AbortCode::ReadOnly)
                }
            }
            None => {
                if objects.keys().any(|(i, _)| *i == index) {
                    Err(AbortCode::NoSuchSubIndex)
                } else {
                    Err(AbortCode::NoSuchObject)
                }
            }
        }
    }

    fn write_object(&self, index: u16, sub: u8, bytes: &[u8]) -> Result<(), AbortCode> {
        self.check_writable(index, sub)?;

        if index == object_ids::PROGRAM && sub == program_subs::CONTROL {
            let mut program = self.state.program.lock().unwrap();
            let cmd = *bytes.first().ok_or(AbortCode::DataTypeMismatchLengthLow)?;
            program.control_log.push(cmd);
            if cmd == values::PROGRAM_CTRL_CLEAR {
                program.data.clear();
            }
            return Ok(());
        }
        if index == object_ids::PROGRAM && sub == program_subs::DATA {
            self.state.program.lock().unwrap().data = bytes.to_vec();
            return Ok(());
        }

        let mut objects = self.state.objects.lock().unwrap();
        let object = objects.get_mut(&(index, sub)).ok_or(AbortCode::NoSuchObject)?;
        object.data = bytes.to_vec();
        Ok(())
    }
}
