//! In-memory CMSIS-DAP probe attached to a simulated micro:bit.
//!
//! The simulation covers the DP/AP registers with TAR auto-increment, a flat
//! memory map (flash, RAM, FICR, Cortex-M debug registers), the DAPLink
//! vendor commands and the two RAM routines used for partial flashing. When
//! the core is resumed at the entry point of one of those routines, its
//! effect is applied at once and the core halts again.

use {
    crate::{
        board::BoardId,
        device::{DeviceFilter, Host, MICROBIT_PRODUCT_ID, MICROBIT_VENDOR_ID, ProbeId, ProbeInfo},
        error::{Error, HexGenerationError, Result},
        flash::{
            FlashDataSource,
            pages::murmur3_core,
            partial::LOAD_ADDR,
        },
        target::{
            FICR_CODEPAGESIZE, FICR_CODESIZE, Session,
            cortex_m::{
                AIRCR_SYSRESETREQ, AIRCR_VECTKEY, DCRDR, DCRSR, DCRSR_REGWNR, DEMCR,
                DEMCR_VC_CORERESET, DFSR, DHCSR, NVIC_AIRCR, dhcsr,
            },
        },
        transport::{DEFAULT_PACKET_SIZE, Transport},
    },
    byteorder::{ByteOrder, LittleEndian},
    std::{
        collections::{HashMap, VecDeque},
        io,
        sync::{Arc, Mutex},
        time::Instant,
    },
};

/// Serial number of a V2 board.
pub(crate) const V2_SERIAL: &str = "9904360251974e450039900a00000041000000009796990b";

/// Identification code returned for DPIDR.
const IDCODE: u32 = 0x2ba0_1477;

pub(crate) type Shared = Arc<Mutex<ProbeState>>;

/// Observable and configurable state of the simulated board.
pub(crate) struct ProbeState {
    pub(crate) packet_size: usize,

    // debug port
    pub(crate) dap_connects: usize,
    pub(crate) dap_disconnects: usize,
    ctrl_stat: u32,
    select: u32,
    csw: u32,
    tar: u32,

    // memory
    pub(crate) page_size: u32,
    pub(crate) num_pages: u32,
    pub(crate) flash: Vec<u8>,
    ram: HashMap<u32, u32>,

    // core
    halted: bool,
    regs: [u32; 16],
    dcrdr: u32,
    demcr: u32,
    pub(crate) resets: usize,
    pub(crate) stuck_in_reset: bool,
    pub(crate) failed_resets: usize,
    fault: bool,
    pub(crate) checksum_runs: usize,
    pub(crate) page_writes: Vec<u32>,
    pub(crate) page_sources: Vec<u32>,
    pub(crate) fail_page_copy: bool,

    // fault injection
    pub(crate) wait_responses: usize,
    pub(crate) block_write_times: Vec<Instant>,
    pub(crate) echo_override: Option<u8>,
    pub(crate) status_override: Option<u8>,
    pub(crate) unplugged: bool,
    pub(crate) claim_error: bool,
    pub(crate) no_interface: bool,

    // DAPLink
    pub(crate) flash_open_status: u8,
    image: Vec<u8>,
    pub(crate) flash_writes: usize,
    pub(crate) full_flashes: Vec<Vec<u8>>,
    pub(crate) daplink_resets: usize,
    pub(crate) baud: u32,
    pub(crate) baud_writes: usize,
    pub(crate) serial_rx: VecDeque<Vec<u8>>,
    pub(crate) serial_tx: Vec<u8>,
    pub(crate) serial_writes: usize,
    pub(crate) serial_error: bool,
}

impl ProbeState {
    pub(crate) fn new() -> Self {
        let page_size = 256;
        let num_pages = 16;
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            dap_connects: 0,
            dap_disconnects: 0,
            ctrl_stat: 0,
            select: 0,
            csw: 0,
            tar: 0,
            page_size,
            num_pages,
            flash: vec![0xFF; (page_size * num_pages) as usize],
            ram: HashMap::new(),
            halted: false,
            regs: [0; 16],
            dcrdr: 0,
            demcr: 0,
            resets: 0,
            stuck_in_reset: false,
            failed_resets: 0,
            fault: false,
            checksum_runs: 0,
            page_writes: Vec::new(),
            page_sources: Vec::new(),
            fail_page_copy: false,
            wait_responses: 0,
            block_write_times: Vec::new(),
            echo_override: None,
            status_override: None,
            unplugged: false,
            claim_error: false,
            no_interface: false,
            flash_open_status: 0,
            image: Vec::new(),
            flash_writes: 0,
            full_flashes: Vec::new(),
            daplink_resets: 0,
            baud: 9600,
            baud_writes: 0,
            serial_rx: VecDeque::new(),
            serial_tx: Vec::new(),
            serial_writes: 0,
            serial_error: false,
        }
    }

    pub(crate) fn shared() -> Shared {
        Arc::new(Mutex::new(Self::new()))
    }

    fn handle(&mut self, packet: &[u8]) -> Vec<u8> {
        let op = packet[0];
        let mut response = match op {
            0x00 => self.info(packet),
            0x02 => {
                self.dap_connects += 1;
                vec![op, 1]
            },
            0x03 => {
                self.dap_disconnects += 1;
                vec![op, 0]
            },
            0x01 | 0x04 | 0x08 | 0x09 | 0x10 | 0x11 | 0x12 | 0x13 => vec![op, 0],
            0x05 => self.transfer(packet),
            0x06 => self.transfer_block(packet),
            0x81 => {
                let mut response = vec![op];
                response.extend_from_slice(&self.baud.to_le_bytes());
                response
            },
            0x82 => {
                self.baud = LittleEndian::read_u32(&packet[1..5]);
                self.baud_writes += 1;
                vec![op, 0]
            },
            0x83 => self.serial_read(),
            0x84 => {
                let len = usize::from(packet[1]);
                self.serial_tx
                    .extend_from_slice(&packet[2..2 + len]);
                self.serial_writes += 1;
                vec![op, packet[1]]
            },
            0x89 => {
                self.daplink_resets += 1;
                vec![op, 0]
            },
            0x8A => {
                self.image.clear();
                vec![op, self.flash_open_status]
            },
            0x8B => {
                let image = std::mem::take(&mut self.image);
                let len = image.len().min(self.flash.len());
                self.flash[..len].copy_from_slice(&image[..len]);
                self.full_flashes.push(image);
                vec![op, 0]
            },
            0x8C => {
                let len = usize::from(packet[1]);
                self.image
                    .extend_from_slice(&packet[2..2 + len]);
                self.flash_writes += 1;
                vec![op, 0]
            },
            _ => vec![0xFF],
        };

        if let Some(echo) = self.echo_override {
            response[0] = echo;
        }
        if let (Some(status), Some(slot)) = (self.status_override, response.get_mut(1)) {
            *slot = status;
        }
        response
    }

    fn info(&self, packet: &[u8]) -> Vec<u8> {
        match packet.get(1) {
            Some(0xFF) => {
                let size = self.packet_size as u16;
                vec![0x00, 2, size as u8, (size >> 8) as u8]
            },
            _ => vec![0x00, 0],
        }
    }

    fn serial_read(&mut self) -> Vec<u8> {
        if self.serial_error {
            return vec![0xFF];
        }
        let mut response = vec![0x83, 0];
        if let Some(mut chunk) = self.serial_rx.pop_front() {
            let max = (self.packet_size - 2).min(255);
            if chunk.len() > max {
                let rest = chunk.split_off(max);
                self.serial_rx.push_front(rest);
            }
            response[1] = chunk.len() as u8;
            response.extend(chunk);
        }
        response
    }

    fn transfer(&mut self, packet: &[u8]) -> Vec<u8> {
        let count = usize::from(packet[2]);
        let mut reads = Vec::new();
        let mut i = 3;

        for _ in 0..count {
            let request = packet[i];
            i += 1;
            if request & 0x02 == 0 {
                let value = LittleEndian::read_u32(&packet[i..i + 4]);
                i += 4;
                self.reg_write(request, value);
            } else {
                let value = self.reg_read(request);
                reads.extend_from_slice(&value.to_le_bytes());
            }
        }

        let ack = if std::mem::take(&mut self.fault) { 4 } else { 1 };
        let mut response = vec![0x05, count as u8, ack];
        response.extend(reads);
        response
    }

    fn transfer_block(&mut self, packet: &[u8]) -> Vec<u8> {
        self.block_write_times
            .push(Instant::now());
        if self.wait_responses > 0 {
            self.wait_responses -= 1;
            return vec![0x06, 0, 0, 2];
        }

        let count = usize::from(LittleEndian::read_u16(&packet[2..4]));
        let request = packet[4];
        let mut response = vec![0x06, packet[2], packet[3], 1];
        for k in 0..count {
            if request & 0x02 == 0 {
                let at = 5 + k * 4;
                let value = LittleEndian::read_u32(&packet[at..at + 4]);
                self.reg_write(request, value);
            } else {
                let value = self.reg_read(request);
                response.extend_from_slice(&value.to_le_bytes());
            }
        }
        response
    }

    fn reg_write(&mut self, request: u8, value: u32) {
        let addr = request & 0x0C;
        if request & 0x01 == 0 {
            match addr {
                0x4 => {
                    let mut status = value;
                    if value & (1 << 30) != 0 {
                        status |= 1 << 31;
                    }
                    if value & (1 << 28) != 0 {
                        status |= 1 << 29;
                    }
                    self.ctrl_stat = status;
                },
                0x8 => self.select = value,
                _ => {},
            }
        } else {
            match addr {
                0x0 => self.csw = value,
                0x4 => self.tar = value,
                _ => {
                    self.mem_write(self.tar, value);
                    self.tar = self.tar.wrapping_add(4);
                },
            }
        }
    }

    fn reg_read(&mut self, request: u8) -> u32 {
        let addr = request & 0x0C;
        if request & 0x01 == 0 {
            match addr {
                0x0 => IDCODE,
                0x4 => self.ctrl_stat,
                0x8 => self.select,
                _ => 0,
            }
        } else {
            match addr {
                0x0 => self.csw,
                0x4 => self.tar,
                _ => {
                    let value = self.mem_read(self.tar);
                    self.tar = self.tar.wrapping_add(4);
                    value
                },
            }
        }
    }

    fn flash_word(&self, addr: u32) -> Option<u32> {
        let at = addr as usize;
        self.flash
            .get(at..at + 4)
            .map(LittleEndian::read_u32)
    }

    pub(crate) fn mem_read(&self, addr: u32) -> u32 {
        match addr {
            FICR_CODEPAGESIZE => self.page_size,
            FICR_CODESIZE => self.num_pages,
            DHCSR => {
                let mut status = dhcsr::S_REGRDY | dhcsr::C_DEBUGEN;
                if self.halted {
                    status |= dhcsr::S_HALT;
                }
                if self.stuck_in_reset {
                    status |= dhcsr::S_RESET_ST;
                }
                status
            },
            DCRDR => self.dcrdr,
            DEMCR => self.demcr,
            _ => self
                .flash_word(addr)
                .unwrap_or_else(|| {
                    self.ram
                        .get(&addr)
                        .copied()
                        .unwrap_or(0)
                }),
        }
    }

    fn mem_write(&mut self, addr: u32, value: u32) {
        match addr {
            DHCSR => self.write_dhcsr(value),
            DCRDR => self.dcrdr = value,
            DCRSR => {
                let reg = (value & 0x1F) as usize;
                if reg < self.regs.len() {
                    if value & DCRSR_REGWNR != 0 {
                        self.regs[reg] = self.dcrdr;
                    } else {
                        self.dcrdr = self.regs[reg];
                    }
                }
            },
            DEMCR => self.demcr = value,
            DFSR => {},
            NVIC_AIRCR => {
                if value == AIRCR_VECTKEY | AIRCR_SYSRESETREQ {
                    if self.failed_resets > 0 {
                        self.failed_resets -= 1;
                        self.fault = true;
                        return;
                    }
                    self.resets += 1;
                    self.halted = self.demcr & DEMCR_VC_CORERESET != 0;
                }
            },
            _ => {
                let at = addr as usize;
                if let Some(slot) = self.flash.get_mut(at..at + 4) {
                    LittleEndian::write_u32(slot, value);
                } else {
                    self.ram.insert(addr, value);
                }
            },
        }
    }

    fn write_dhcsr(&mut self, value: u32) {
        if value & 0xFFFF_0000 != dhcsr::DBGKEY {
            return;
        }
        if value & dhcsr::C_HALT != 0 {
            self.halted = true;
        } else if self.halted {
            self.run();
        }
    }

    /// Apply the effect of the routine at PC, if it is one we know.
    fn run(&mut self) {
        let pc = self.regs[15];
        self.halted = false;

        if pc == LOAD_ADDR + 1 {
            let dst = self.regs[0];
            let page_size = self.regs[2] as usize;
            let num_pages = self.regs[3];
            for page in 0..num_pages {
                let start = page as usize * page_size;
                let [h0, h1] = murmur3_core(&self.flash[start..start + page_size]);
                self.ram
                    .insert(dst + page * 8, h0);
                self.ram
                    .insert(dst + page * 8 + 4, h1);
            }
            self.checksum_runs += 1;
            self.halted = true;
        } else if pc == LOAD_ADDR + 5 {
            if self.fail_page_copy {
                return;
            }
            let dst = self.regs[0];
            let src = self.regs[1];
            for word in 0..self.regs[2] {
                let value = self
                    .ram
                    .get(&(src + word * 4))
                    .copied()
                    .unwrap_or(0);
                let at = (dst + word * 4) as usize;
                if let Some(slot) = self.flash.get_mut(at..at + 4) {
                    LittleEndian::write_u32(slot, value);
                }
            }
            self.page_writes.push(dst);
            self.page_sources.push(src);
            self.halted = true;
        }
    }
}

/// Transport end of the simulated probe.
pub(crate) struct MockProbe {
    state: Shared,
    pending: VecDeque<Vec<u8>>,
    closed: bool,
}

impl MockProbe {
    pub(crate) fn new(state: Shared) -> Self {
        Self {
            state,
            pending: VecDeque::new(),
            closed: false,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ProbeState>> {
        self.state
            .lock()
            .map_err(|_| Error::Protocol("probe state poisoned".to_string()))
    }
}

impl Transport for MockProbe {
    fn packet_size(&self) -> usize {
        self.lock()
            .map_or(DEFAULT_PACKET_SIZE, |s| s.packet_size)
    }

    fn write(&mut self, packet: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::DeviceDisconnected);
        }
        let response = {
            let mut state = self.lock()?;
            if state.unplugged {
                return Err(Error::DeviceDisconnected);
            }
            state.handle(packet)
        };
        self.pending
            .push_back(response);
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        self.pending
            .pop_front()
            .ok_or_else(|| Error::Protocol("no response pending".to_string()))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Route library logs to the test harness output.
pub(crate) fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

/// Session over a fresh probe, not yet connected.
pub(crate) fn session_for(state: &Shared) -> Session<MockProbe> {
    init_logger();
    Session::new(MockProbe::new(Arc::clone(state)), Some(V2_SERIAL.to_string()))
}

/// Session over a fresh probe, after the first handshake.
pub(crate) fn connected_session() -> (Session<MockProbe>, Shared) {
    let state = ProbeState::shared();
    let mut session = session_for(&state);
    session
        .reconnect()
        .expect("mock handshake");
    (session, state)
}

/// Host with a fixed set of simulated boards.
pub(crate) struct MockHost {
    pub(crate) probes: Vec<(ProbeInfo, Shared)>,
    pub(crate) supported: bool,
    removed: Mutex<Vec<ProbeId>>,
    pub(crate) opens: Mutex<usize>,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        Self {
            probes: Vec::new(),
            supported: true,
            removed: Mutex::new(Vec::new()),
            opens: Mutex::new(0),
        }
    }

    /// Host with a single V2 board.
    pub(crate) fn single() -> (Self, Shared) {
        init_logger();
        let state = ProbeState::shared();
        let host = Self::new().with_probe(1, V2_SERIAL, Arc::clone(&state));
        (host, state)
    }

    pub(crate) fn with_probe(mut self, address: u8, serial: &str, state: Shared) -> Self {
        self.probes
            .push((
                ProbeInfo {
                    id: ProbeId { bus: 1, address },
                    vendor_id: MICROBIT_VENDOR_ID,
                    product_id: MICROBIT_PRODUCT_ID,
                    manufacturer: Some("ARM".to_string()),
                    product: Some("BBC micro:bit CMSIS-DAP".to_string()),
                    serial_number: Some(serial.to_string()),
                },
                state,
            ));
        self
    }

    /// Simulate unplugging a board.
    pub(crate) fn unplug(&self, id: ProbeId) {
        for (info, state) in &self.probes {
            if info.id == id {
                state
                    .lock()
                    .expect("probe state")
                    .unplugged = true;
            }
        }
        self.removed
            .lock()
            .expect("removed list")
            .push(id);
    }
}

impl Host for MockHost {
    type Transport = MockProbe;

    fn is_supported(&self) -> bool {
        self.supported
    }

    fn list_probes(&self, filter: &DeviceFilter) -> Result<Vec<ProbeInfo>> {
        Ok(self
            .probes
            .iter()
            .filter(|(info, state)| {
                filter.matches(info.vendor_id, info.product_id)
                    && !state
                        .lock()
                        .is_ok_and(|s| s.unplugged)
            })
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn open(&self, probe: &ProbeInfo) -> Result<MockProbe> {
        let (_, state) = self
            .probes
            .iter()
            .find(|(info, _)| info.id == probe.id)
            .ok_or(Error::DeviceDisconnected)?;

        {
            let state = state
                .lock()
                .map_err(|_| Error::Protocol("probe state poisoned".to_string()))?;
            if state.unplugged {
                return Err(Error::DeviceDisconnected);
            }
            if state.no_interface {
                return Err(Error::NoValidInterfaces);
            }
            if state.claim_error {
                return Err(Error::ClaimInterface(io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    "interface claimed by another process",
                )));
            }
        }

        if let Ok(mut opens) = self.opens.lock() {
            *opens += 1;
        }
        Ok(MockProbe::new(Arc::clone(state)))
    }

    fn removed_probes(&self) -> Vec<ProbeId> {
        self.removed
            .lock()
            .map(|mut removed| removed.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Data source serving one image for both strategies.
pub(crate) struct ImageSource {
    image: Vec<u8>,
    pub(crate) boards: Vec<BoardId>,
}

impl ImageSource {
    pub(crate) fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            boards: Vec::new(),
        }
    }
}

impl FlashDataSource for ImageSource {
    fn partial_flash_data(&mut self, board: BoardId) -> std::result::Result<Vec<u8>, HexGenerationError> {
        self.boards
            .push(board);
        Ok(self.image.clone())
    }

    fn full_flash_data(&mut self, board: BoardId) -> std::result::Result<Vec<u8>, HexGenerationError> {
        self.boards
            .push(board);
        Ok(self.image.clone())
    }
}
