//! SD-card command protocol over SPI — init handshake plus single-block
//! reads and writes on 512-byte sectors.
//!
//! The card is driven purely through byte exchanges: a 6-byte command
//! frame, a response-poll window, then data tokens. Only the commands the
//! logger needs are implemented (CMD0/CMD8/CMD55/ACMD41/CMD17/CMD24).
//! Checksums are the SPI-mode placeholders: the card only enforces CRC on
//! CMD0 and CMD8 (issued before CRC checking is off), so those two carry
//! their fixed frame CRCs and every later frame carries `0x01`. Block CRC
//! trailers are read and dropped without verification, matching what a
//! card in SPI mode does.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::config;

/// SD commands used by this driver
mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const SEND_IF_COND: u8 = 8;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const WRITE_BLOCK: u8 = 24;
    pub const SD_SEND_OP_COND: u8 = 41;
    pub const APP_CMD: u8 = 55;
}

/// R1 response: card in idle state after CMD0
const R1_IDLE: u8 = 0x01;
/// R1 response: card ready
const R1_READY: u8 = 0x00;
/// Marks the start of a 512-byte data block in either direction
const DATA_START_TOKEN: u8 = 0xFE;
/// Low 5 bits of the data response byte after a write
const DATA_RESPONSE_MASK: u8 = 0x1F;
const DATA_ACCEPTED: u8 = 0x05;
/// CMD8 argument: 2.7–3.6 V range plus check pattern 0xAA
const IF_COND_PATTERN: u32 = 0x1AA;
/// ACMD41 argument: host supports high-capacity cards
const OCR_HCS: u32 = 0x4000_0000;

/// Frame CRCs: real values for the two commands checked before CRC
/// enforcement is dropped, placeholder for everything after.
const CRC_CMD0: u8 = 0x95;
const CRC_CMD8: u8 = 0x87;
const CRC_PLACEHOLDER: u8 = 0x01;

pub const BLOCK_LEN: usize = 512;

/// Errors from the card protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdError<E> {
    /// Card never acknowledged CMD0 with the idle response.
    NotResponding,
    /// A bounded wait (init, data token, busy) ran out of attempts.
    Timeout,
    /// Card answered a block command with a non-zero status.
    CardRejected,
    /// Card refused the data block of a write.
    WriteRejected,
    /// Operation attempted before a successful `initialize`.
    NotInitialized,
    /// Raw transfer on the underlying bus failed.
    Bus(E),
    /// Chip-select line could not be driven.
    ChipSelect,
}

/// Iteration ceilings and pacing for the protocol's polling loops. These
/// are the only timeout mechanism available; tests shrink them to run
/// against a simulated bus without real delays.
#[derive(Clone, Copy, Debug)]
pub struct SdLimits {
    /// Byte exchanges to poll for a command response
    pub response_attempts: u32,
    /// ACMD41 attempts before init gives up
    pub init_attempts: u32,
    /// Pacing delay between ACMD41 attempts (ms)
    pub init_pacing_ms: u32,
    /// Byte exchanges to wait for the read data token
    pub token_attempts: u32,
    /// Byte exchanges to wait for the write busy state to clear
    pub busy_attempts: u32,
}

impl Default for SdLimits {
    fn default() -> Self {
        Self {
            response_attempts: config::SD_RESPONSE_ATTEMPTS,
            init_attempts: config::SD_INIT_ATTEMPTS,
            init_pacing_ms: config::SD_INIT_PACING_MS,
            token_attempts: config::SD_TOKEN_ATTEMPTS,
            busy_attempts: config::SD_BUSY_ATTEMPTS,
        }
    }
}

/// SD card on an SPI bus. Owns the bus handle, the chip-select line and a
/// delay provider; callers that share the bus wrap the whole driver in a
/// mutex and hold it for a complete operation (the driver is not
/// reentrant).
pub struct SdSpi<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    limits: SdLimits,
    initialized: bool,
}

impl<SPI, CS, D> SdSpi<SPI, CS, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, cs: CS, delay: D) -> Self {
        Self::with_limits(spi, cs, delay, SdLimits::default())
    }

    pub fn with_limits(spi: SPI, cs: CS, delay: D, limits: SdLimits) -> Self {
        Self {
            spi,
            cs,
            delay,
            limits,
            initialized: false,
        }
    }

    /// `true` after a successful `initialize`.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Force re-initialization on the next attempt (caller-side retry).
    pub fn mark_uninitialized(&mut self) {
        self.initialized = false;
    }

    /// Direct access to the bus, e.g. to raise the SPI clock after init.
    pub fn bus_mut(&mut self) -> &mut SPI {
        &mut self.spi
    }

    /// Reset the card into SPI mode and bring it out of idle state.
    pub fn initialize(&mut self) -> Result<(), SdError<SPI::Error>> {
        self.initialized = false;
        let result = self.initialize_inner();
        if result.is_err() {
            // never leave the bus held
            let _ = self.cs.set_high();
        }
        self.initialized = result.is_ok();
        result
    }

    fn initialize_inner(&mut self) -> Result<(), SdError<SPI::Error>> {
        // Power-up: let the card settle with CS deasserted
        self.deselect()?;
        for _ in 0..10 {
            self.exchange(0xFF)?;
        }

        if self.command(cmd::GO_IDLE_STATE, 0)? != R1_IDLE {
            self.deselect()?;
            return Err(SdError::NotResponding);
        }
        self.release()?;

        // CMD8: response and 4-byte payload accepted without verification
        self.command(cmd::SEND_IF_COND, IF_COND_PATTERN)?;
        for _ in 0..4 {
            self.exchange(0xFF)?;
        }
        self.release()?;

        // ACMD41 until the card leaves idle state
        for _ in 0..self.limits.init_attempts {
            self.command(cmd::APP_CMD, 0)?;
            self.release()?;

            let response = self.command(cmd::SD_SEND_OP_COND, OCR_HCS)?;
            self.release()?;
            if response == R1_READY {
                return Ok(());
            }
            self.delay.delay_ms(self.limits.init_pacing_ms);
        }

        Err(SdError::Timeout)
    }

    /// Read one 512-byte sector.
    pub fn read_block(
        &mut self,
        sector: u32,
        buf: &mut [u8; BLOCK_LEN],
    ) -> Result<(), SdError<SPI::Error>> {
        let result = self.read_block_inner(sector, buf);
        if result.is_err() {
            let _ = self.cs.set_high();
        }
        result
    }

    fn read_block_inner(
        &mut self,
        sector: u32,
        buf: &mut [u8; BLOCK_LEN],
    ) -> Result<(), SdError<SPI::Error>> {
        if self.command(cmd::READ_SINGLE_BLOCK, sector)? != R1_READY {
            self.deselect()?;
            return Err(SdError::CardRejected);
        }

        let mut attempts = self.limits.token_attempts;
        while self.exchange(0xFF)? != DATA_START_TOKEN {
            attempts -= 1;
            if attempts == 0 {
                self.deselect()?;
                return Err(SdError::Timeout);
            }
        }

        // keep MOSI high while clocking the payload out of the card
        buf.fill(0xFF);
        self.spi.transfer_in_place(buf).map_err(SdError::Bus)?;

        // block CRC: read, not validated
        self.exchange(0xFF)?;
        self.exchange(0xFF)?;

        self.release()
    }

    /// Write one 512-byte sector.
    pub fn write_block(
        &mut self,
        sector: u32,
        data: &[u8; BLOCK_LEN],
    ) -> Result<(), SdError<SPI::Error>> {
        let result = self.write_block_inner(sector, data);
        if result.is_err() {
            let _ = self.cs.set_high();
        }
        result
    }

    fn write_block_inner(
        &mut self,
        sector: u32,
        data: &[u8; BLOCK_LEN],
    ) -> Result<(), SdError<SPI::Error>> {
        if self.command(cmd::WRITE_BLOCK, sector)? != R1_READY {
            self.deselect()?;
            return Err(SdError::CardRejected);
        }

        self.exchange(DATA_START_TOKEN)?;
        self.spi.write(data).map_err(SdError::Bus)?;
        // dummy block CRC, never computed
        self.exchange(0xFF)?;
        self.exchange(0xFF)?;

        let response = self.exchange(0xFF)?;
        if response & DATA_RESPONSE_MASK != DATA_ACCEPTED {
            self.deselect()?;
            return Err(SdError::WriteRejected);
        }

        // card holds the line at 0x00 while programming the block
        let mut attempts = self.limits.busy_attempts;
        while self.exchange(0xFF)? == 0x00 {
            attempts -= 1;
            if attempts == 0 {
                self.deselect()?;
                return Err(SdError::Timeout);
            }
        }

        self.release()
    }

    /// Send one command frame and poll for its R1 response. Returns the
    /// last byte read; callers compare it against the code they expect.
    fn command(&mut self, command: u8, arg: u32) -> Result<u8, SdError<SPI::Error>> {
        let crc = match command {
            cmd::GO_IDLE_STATE => CRC_CMD0,
            cmd::SEND_IF_COND => CRC_CMD8,
            _ => CRC_PLACEHOLDER,
        };

        self.select()?;

        self.exchange(0x40 | command)?;
        for byte in arg.to_be_bytes() {
            self.exchange(byte)?;
        }
        self.exchange(crc)?;

        let mut response = 0xFF;
        for _ in 0..self.limits.response_attempts {
            response = self.exchange(0xFF)?;
            if response & 0x80 == 0 {
                break;
            }
        }
        Ok(response)
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, SdError<SPI::Error>> {
        let mut rx = [0u8];
        self.spi.transfer(&mut rx, &[byte]).map_err(SdError::Bus)?;
        Ok(rx[0])
    }

    fn select(&mut self) -> Result<(), SdError<SPI::Error>> {
        self.cs.set_low().map_err(|_| SdError::ChipSelect)
    }

    fn deselect(&mut self) -> Result<(), SdError<SPI::Error>> {
        self.cs.set_high().map_err(|_| SdError::ChipSelect)
    }

    /// Deassert CS and clock one trailing idle byte so the card can finish
    /// internal processing before the bus moves on.
    fn release(&mut self) -> Result<(), SdError<SPI::Error>> {
        self.deselect()?;
        self.exchange(0xFF)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod sim {
    //! Behavioral SD-card simulator: an in-memory sector store behind a
    //! byte-exchange engine, driven through `SpiBus` + `OutputPin` mocks.

    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use embedded_hal::delay::DelayNs;
    use embedded_hal::digital::{self, OutputPin};
    use embedded_hal::spi::{self, SpiBus};

    use super::BLOCK_LEN;

    #[derive(Clone, Copy)]
    enum Receiving {
        /// waiting for the 0xFE token of a CMD24 payload
        Token { sector: u32 },
        /// collecting payload + CRC bytes of a CMD24
        Data { sector: u32, got: usize },
        /// nothing special: assemble command frames
        Commands,
    }

    pub struct CardSim {
        /// respond 0x01 to CMD0 (false simulates a dead card)
        pub idle_ok: bool,
        /// ACMD41 attempts before the card reports ready
        pub acmd41_ready_after: u32,
        /// answer CMD17/CMD24 with a non-zero status
        pub reject_reads: bool,
        pub reject_writes: bool,
        /// idle bytes before the 0xFE token on reads
        pub data_token_lag: u32,
        /// data response byte for writes (0xE5 = accepted)
        pub write_response: u8,
        /// busy (0x00) exchanges after an accepted write
        pub busy_bytes: u32,

        pub selected: bool,
        sectors: BTreeMap<u32, [u8; BLOCK_LEN]>,
        out: VecDeque<u8>,
        frame: [u8; 6],
        frame_len: usize,
        receiving: Receiving,
        payload: Vec<u8>,
        acmd41_seen: u32,
        app_cmd: bool,
    }

    impl CardSim {
        pub fn new() -> Self {
            Self {
                idle_ok: true,
                acmd41_ready_after: 3,
                reject_reads: false,
                reject_writes: false,
                data_token_lag: 2,
                write_response: 0xE5,
                busy_bytes: 4,
                selected: false,
                sectors: BTreeMap::new(),
                out: VecDeque::new(),
                frame: [0; 6],
                frame_len: 0,
                receiving: Receiving::Commands,
                payload: Vec::new(),
                acmd41_seen: 0,
                app_cmd: false,
            }
        }

        pub fn sector(&self, sector: u32) -> Option<&[u8; BLOCK_LEN]> {
            self.sectors.get(&sector)
        }

        pub fn set_sector(&mut self, sector: u32, data: [u8; BLOCK_LEN]) {
            self.sectors.insert(sector, data);
        }

        fn deselect(&mut self) {
            self.selected = false;
            self.out.clear();
            self.frame_len = 0;
            self.receiving = Receiving::Commands;
            self.payload.clear();
        }

        pub fn exchange(&mut self, tx: u8) -> u8 {
            if !self.selected {
                return 0xFF;
            }
            // queued response bytes drain first; the host only clocks
            // idle bytes while polling for them
            if let Some(byte) = self.out.pop_front() {
                return byte;
            }
            match self.receiving {
                Receiving::Token { sector } => {
                    if tx == 0xFE {
                        self.receiving = Receiving::Data { sector, got: 0 };
                        self.payload.clear();
                    }
                    return 0xFF;
                }
                Receiving::Data { sector, got } => {
                    self.payload.push(tx);
                    let got = got + 1;
                    if got == BLOCK_LEN + 2 {
                        // payload plus two CRC bytes, CRC dropped
                        let mut data = [0u8; BLOCK_LEN];
                        data.copy_from_slice(&self.payload[..BLOCK_LEN]);
                        self.sectors.insert(sector, data);
                        self.receiving = Receiving::Commands;
                        self.out.push_back(self.write_response);
                        for _ in 0..self.busy_bytes {
                            self.out.push_back(0x00);
                        }
                    } else {
                        self.receiving = Receiving::Data { sector, got };
                    }
                    return 0xFF;
                }
                Receiving::Commands => {}
            }

            // assemble a command frame; 0xFF outside a frame is idle clocking
            if self.frame_len == 0 && tx & 0xC0 != 0x40 {
                return 0xFF;
            }
            self.frame[self.frame_len] = tx;
            self.frame_len += 1;
            if self.frame_len == 6 {
                self.frame_len = 0;
                self.process_command();
            }
            0xFF
        }

        fn process_command(&mut self) {
            let command = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
            let app_cmd = core::mem::replace(&mut self.app_cmd, false);

            match command {
                0 => {
                    if self.idle_ok {
                        self.respond(0x01);
                    }
                    // a dead card stays silent: the host keeps reading 0xFF
                }
                8 => {
                    self.respond(0x01);
                    // R7 payload echoes the voltage range and check pattern
                    self.out.extend([0x00, 0x00, 0x01, 0xAA]);
                }
                55 => {
                    self.respond(0x01);
                    self.app_cmd = true;
                }
                41 if app_cmd => {
                    self.acmd41_seen += 1;
                    let r1 = if self.acmd41_seen > self.acmd41_ready_after {
                        0x00
                    } else {
                        0x01
                    };
                    self.respond(r1);
                }
                17 => {
                    if self.reject_reads {
                        self.respond(0x04);
                    } else {
                        self.respond(0x00);
                        for _ in 0..self.data_token_lag {
                            self.out.push_back(0xFF);
                        }
                        self.out.push_back(0xFE);
                        let data = self.sectors.get(&arg).copied().unwrap_or([0u8; BLOCK_LEN]);
                        self.out.extend(data);
                        // block CRC trailer
                        self.out.extend([0xAA, 0x55]);
                    }
                }
                24 => {
                    if self.reject_writes {
                        self.respond(0x04);
                    } else {
                        self.respond(0x00);
                        self.receiving = Receiving::Token { sector: arg };
                    }
                }
                _ => {
                    // illegal command
                    self.respond(0x05);
                }
            }
        }

        fn respond(&mut self, r1: u8) {
            // one idle byte of response latency, like a real card
            self.out.push_back(0xFF);
            self.out.push_back(r1);
        }
    }

    pub type SharedCard = Rc<RefCell<CardSim>>;

    pub struct SimSpiBus(pub SharedCard);

    impl spi::ErrorType for SimSpiBus {
        type Error = spi::ErrorKind;
    }

    impl SpiBus for SimSpiBus {
        fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
            for word in words {
                *word = self.0.borrow_mut().exchange(0xFF);
            }
            Ok(())
        }

        fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
            for word in words {
                self.0.borrow_mut().exchange(*word);
            }
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
            let mut card = self.0.borrow_mut();
            for i in 0..read.len().max(write.len()) {
                let tx = write.get(i).copied().unwrap_or(0xFF);
                let rx = card.exchange(tx);
                if let Some(slot) = read.get_mut(i) {
                    *slot = rx;
                }
            }
            Ok(())
        }

        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
            let mut card = self.0.borrow_mut();
            for word in words {
                *word = card.exchange(*word);
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    pub struct SimCsPin(pub SharedCard);

    impl digital::ErrorType for SimCsPin {
        type Error = digital::ErrorKind;
    }

    impl OutputPin for SimCsPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0.borrow_mut().selected = true;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0.borrow_mut().deselect();
            Ok(())
        }
    }

    /// Delays are pure pacing in this driver; the simulator needs none.
    pub struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }
}
