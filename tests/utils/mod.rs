//! Useful library code for tests

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_sdspi::sdcard::proto::{crc16, crc7, ACMD41_HCS};
use embedded_sdspi::{AcquireOpts, CardGeneration, SdCard, Transport, TransportError};

/// A version 1 CSD from a 1GB SDSC card: 1,984,000 blocks, byte addressed.
pub const CSD_V1: [u8; 16] = hex_literal::hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");

/// A version 2 CSD from a 4GB SDHC card: 7,710,720 blocks.
pub const CSD_V2: [u8; 16] = hex_literal::hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

/// A CID for an "SU04G" card, serial 0x12345678, made June 2013.
pub const CID: [u8; 16] = hex_literal::hex!("03 53 44 53 55 30 34 47 80 12 34 56 78 00 D6 17");

/// The OCR our simulated cards report: 2.7-3.6V.
pub const OCR_VOLTAGES: u32 = 0x00FF_8000;

/// Send logs to the test harness. Set `RUST_LOG=trace` to see the bus
/// traffic.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The contents of the data block at the given card address.
pub fn block_pattern(address: u32) -> [u8; 512] {
    let seed = address.wrapping_mul(31) as u8;
    let mut block = [0u8; 512];
    for (i, b) in block.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8) ^ (i >> 8) as u8;
    }
    block
}

/// How a [`FakeCard`] behaves.
#[derive(Debug, Clone)]
pub struct CardConfig {
    /// V1 cards reject CMD8
    pub generation: CardGeneration,
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    /// How many times ACMD41 reports idle before the card is ready
    pub busy_polls: u32,
    /// Treat ACMD41 with HCS set as an illegal command
    pub rejects_hcs: bool,
    /// Send the start-of-block token before data
    pub send_start_token: bool,
    /// Send this error token instead of the data block
    pub data_error_token: Option<u8>,
    /// 0xFF bytes between the R1 and the start-of-block token
    pub token_gap: usize,
    /// 0xFF bytes between the command and the R1
    pub response_gap: usize,
    /// Answer CMD8 with these four bytes rather than echoing the argument
    pub cmd8_echo: Option<[u8; 4]>,
    /// Commands the card never answers
    pub silent: Vec<u8>,
    /// Send a wrong CRC after data blocks
    pub corrupt_crc: bool,
    /// Answer CMD59 as illegal
    pub refuse_crc: bool,
    /// Once selected, the Chip Select pin won't go high again
    pub stuck_cs: bool,
}

impl CardConfig {
    /// A healthy SDHC card.
    pub fn v2() -> CardConfig {
        CardConfig {
            generation: CardGeneration::V2,
            csd: CSD_V2,
            cid: CID,
            busy_polls: 2,
            rejects_hcs: false,
            send_start_token: true,
            data_error_token: None,
            token_gap: 0,
            response_gap: 1,
            cmd8_echo: None,
            silent: Vec::new(),
            corrupt_crc: false,
            refuse_crc: false,
            stuck_cs: false,
        }
    }

    /// A healthy v1 SDSC card.
    pub fn v1() -> CardConfig {
        CardConfig {
            generation: CardGeneration::V1,
            csd: CSD_V1,
            ..CardConfig::v2()
        }
    }
}

/// A command as the card received it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Sent {
    pub index: u8,
    pub arg: u32,
    /// Came straight after CMD55
    pub app: bool,
    pub frame: [u8; 6],
}

/// A simulated SD card in SPI mode, at the byte level.
pub struct FakeCard {
    pub config: CardConfig,
    /// Every command received, in order
    pub sent: Vec<Sent>,
    /// How many ACMD41s were received
    pub acmd41_count: u32,
    /// Bytes clocked before Chip Select was first asserted
    pub clocks_before_select: usize,
    /// Bytes clocked while deselected, in total
    pub deselected_clocks: usize,
    pub select_count: usize,
    selected: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    idle: bool,
    app_cmd: bool,
    crc_on: bool,
    busy_left: u32,
}

impl FakeCard {
    pub fn new(config: CardConfig) -> FakeCard {
        FakeCard {
            busy_left: config.busy_polls,
            config,
            sent: Vec::new(),
            acmd41_count: 0,
            clocks_before_select: 0,
            deselected_clocks: 0,
            select_count: 0,
            selected: false,
            frame: Vec::new(),
            out: VecDeque::new(),
            idle: true,
            app_cmd: false,
            crc_on: false,
        }
    }

    /// Is Chip Select asserted right now?
    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Is CRC checking switched on?
    pub fn crc_on(&self) -> bool {
        self.crc_on
    }

    /// The command indexes received, in order. ACMDs are listed by their
    /// own index, after a 55.
    pub fn indexes(&self) -> Vec<u8> {
        self.sent.iter().map(|s| s.index).collect()
    }

    /// Every command with the given index.
    pub fn sent_with_index(&self, index: u8) -> Vec<Sent> {
        self.sent.iter().filter(|s| s.index == index).copied().collect()
    }

    fn r1(&self) -> u8 {
        if self.idle {
            0x01
        } else {
            0x00
        }
    }

    fn handle_frame(&mut self, frame: [u8; 6]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = std::mem::take(&mut self.app_cmd);
        self.sent.push(Sent {
            index,
            arg,
            app,
            frame,
        });
        self.out.clear();

        if self.config.silent.contains(&index) {
            return;
        }
        for _ in 0..self.config.response_gap {
            self.out.push_back(0xFF);
        }

        // CMD0 and CMD8 are always checked
        let check_crc = self.crc_on || index == 0 || index == 8;
        if check_crc && frame[5] != crc7(&frame[0..5]) {
            let status = self.r1() | 0x08;
            self.out.push_back(status);
            return;
        }

        match (app, index) {
            (_, 0) => {
                self.idle = true;
                self.crc_on = false;
                self.busy_left = self.config.busy_polls;
                self.out.push_back(0x01);
            }
            (false, 59) => {
                if self.config.refuse_crc {
                    let status = self.r1() | 0x04;
                    self.out.push_back(status);
                } else {
                    self.crc_on = (arg & 1) != 0;
                    let status = self.r1();
                    self.out.push_back(status);
                }
            }
            (false, 8) => match self.config.generation {
                CardGeneration::V1 => {
                    let status = self.r1() | 0x04;
                    self.out.push_back(status);
                }
                CardGeneration::V2 => {
                    let echo = self.config.cmd8_echo.unwrap_or([
                        0x00,
                        0x00,
                        ((arg >> 8) & 0x0F) as u8,
                        arg as u8,
                    ]);
                    let status = self.r1();
                    self.out.push_back(status);
                    self.out.extend(echo);
                }
            },
            (false, 58) => {
                let mut ocr = OCR_VOLTAGES;
                if !self.idle {
                    ocr |= 0x8000_0000;
                    if self.config.csd[0] >> 6 == 1 {
                        ocr |= 0x4000_0000;
                    }
                }
                let status = self.r1();
                self.out.push_back(status);
                self.out.extend(ocr.to_be_bytes());
            }
            (false, 55) => {
                self.app_cmd = true;
                let status = self.r1();
                self.out.push_back(status);
            }
            (true, 41) => {
                self.acmd41_count += 1;
                if self.config.rejects_hcs && (arg & ACMD41_HCS) != 0 {
                    self.out.push_back(0x05);
                } else if self.busy_left > 0 {
                    self.busy_left -= 1;
                    self.out.push_back(0x01);
                } else {
                    self.idle = false;
                    self.out.push_back(0x00);
                }
            }
            (false, 9) if !self.idle => {
                let csd = self.config.csd;
                self.send_data(&csd);
            }
            (false, 10) if !self.idle => {
                let cid = self.config.cid;
                self.send_data(&cid);
            }
            (false, 17) if !self.idle => {
                let byte_addressed = self.config.csd[0] >> 6 == 0;
                if byte_addressed && arg % 512 != 0 {
                    self.out.push_back(0x20);
                } else {
                    self.send_data(&block_pattern(arg));
                }
            }
            _ => {
                let status = self.r1() | 0x04;
                self.out.push_back(status);
            }
        }
    }

    fn send_data(&mut self, data: &[u8]) {
        self.out.push_back(0x00);
        for _ in 0..self.config.token_gap {
            self.out.push_back(0xFF);
        }
        if let Some(token) = self.config.data_error_token {
            self.out.push_back(token);
            return;
        }
        if !self.config.send_start_token {
            return;
        }
        self.out.push_back(0xFE);
        self.out.extend(data.iter().copied());
        let mut crc = crc16(data);
        if self.config.corrupt_crc {
            crc ^= 0xFFFF;
        }
        self.out.extend(crc.to_be_bytes());
    }
}

impl Transport for FakeCard {
    fn transfer_byte(&mut self, out: u8) -> Result<u8, TransportError> {
        if !self.selected {
            self.deselected_clocks += 1;
            if self.select_count == 0 {
                self.clocks_before_select += 1;
            }
            return Ok(0xFF);
        }
        if !self.frame.is_empty() || (out & 0xC0) == 0x40 {
            self.frame.push(out);
            if self.frame.len() == 6 {
                let mut frame = [0u8; 6];
                frame.copy_from_slice(&self.frame);
                self.frame.clear();
                self.handle_frame(frame);
            }
            return Ok(0xFF);
        }
        Ok(self.out.pop_front().unwrap_or(0xFF))
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.selected = true;
        self.select_count += 1;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        if self.config.stuck_cs && self.selected {
            return Err(TransportError::Cs);
        }
        self.selected = false;
        self.frame.clear();
        self.out.clear();
        Ok(())
    }
}

/// A delay that doesn't wait, but counts how long it was asked to.
#[derive(Debug, Clone, Default)]
pub struct FakeDelay {
    total_ns: Rc<Cell<u64>>,
}

impl FakeDelay {
    /// Microseconds of delay asked for, across all clones.
    pub fn total_us(&self) -> u64 {
        self.total_ns.get() / 1000
    }
}

impl embedded_hal::delay::DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns.set(self.total_ns.get() + u64::from(ns));
    }
}

/// Build a driver around a simulated card, with the default options.
pub fn make_sdcard(config: CardConfig) -> (SdCard<FakeCard, FakeDelay>, FakeDelay) {
    make_sdcard_with_options(config, AcquireOpts::default())
}

/// Build a driver around a simulated card.
pub fn make_sdcard_with_options(
    config: CardConfig,
    options: AcquireOpts,
) -> (SdCard<FakeCard, FakeDelay>, FakeDelay) {
    init_logging();
    let delay = FakeDelay::default();
    let sdcard = SdCard::new_with_options(FakeCard::new(config), delay.clone(), options);
    (sdcard, delay)
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
