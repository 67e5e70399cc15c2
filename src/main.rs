//! BME680 environmental logger for RP2350A
//!
//! Samples the sensor every POLL_INTERVAL_MS and appends one CSV record
//! per sample to DATA.CSV on an SPI-attached SD card:
//! `humidity,temperature,pressure,gas_resistance\n`

#![no_std]
#![no_main]

use bme680_logger::blockdev::SdBlockDevice;
use bme680_logger::bme680::Bme680;
use bme680_logger::config::*;
use bme680_logger::pipeline::{self, RecordSink};
use bme680_logger::record::{encode_csv, SampleRecord, MAX_RECORD_LEN};
use bme680_logger::sdspi::{SdError, SdSpi};

use defmt::*;
use embassy_executor::Spawner;
use embassy_rp::gpio::{Level, Output};
use embassy_rp::i2c::{self, I2c};
use embassy_rp::peripherals::{I2C1, SPI1};
use embassy_rp::spi::{self, Spi};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Delay, Duration, Instant, Timer};
use embedded_sdmmc::{Mode, RawFile, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use portable_atomic::{AtomicU32, Ordering};

use {defmt_rtt as _, panic_probe as _};

// ============================================================================
// Shared state
// ============================================================================

/// Bounded sample queue: sensor_task → sd_writer_task
static SAMPLE_QUEUE: Channel<CriticalSectionRawMutex, SampleRecord, SAMPLE_QUEUE_DEPTH> =
    Channel::new();

/// Samples dropped against a full queue (producer never blocks)
static SAMPLES_DROPPED: AtomicU32 = AtomicU32::new(0);

type SensorI2c = I2c<'static, I2C1, i2c::Blocking>;
type SdBus = Spi<'static, SPI1, spi::Blocking>;
type SdCs = Output<'static>;
type CardVolumeManager = VolumeManager<SdBlockDevice<SdBus, SdCs, Delay>, UptimeTimeSource>;

// ============================================================================
// Entry point
// ============================================================================

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    info!("environmental logger starting");

    // ── I2C for the BME680 ──────────────────────────────────────────────
    let i2c = I2c::new_blocking(p.I2C1, p.PIN_3, p.PIN_2, i2c::Config::default());

    // ── SPI for the SD card (slow until the card is initialized) ───────
    let mut spi_config = spi::Config::default();
    spi_config.frequency = SD_SPI_INIT_FREQ;
    let spi = Spi::new_blocking(p.SPI1, p.PIN_10, p.PIN_11, p.PIN_12, spi_config);
    let cs = Output::new(p.PIN_13, Level::High);

    // ── Spawn tasks ─────────────────────────────────────────────────────
    spawner.must_spawn(sensor_task(i2c));
    spawner.must_spawn(sd_writer_task(spi, cs));

    info!("all tasks spawned");
    loop {
        Timer::after(Duration::from_secs(60)).await;
        let dropped = SAMPLES_DROPPED.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("{} samples dropped so far (queue full)", dropped);
        }
    }
}

// ============================================================================
// Sensor task — one forced measurement per poll period, pushed to queue
// ============================================================================

#[embassy_executor::task]
async fn sensor_task(i2c: SensorI2c) {
    info!("sensor task started");

    let mut sensor = Bme680::new(i2c, Delay, BME680_ADDR);
    if let Err(e) = sensor.initialize() {
        error!("sensor init failed: {:?}", Debug2Format(&e));
        // fail-stop: park the task, observable via the log
        loop {
            Timer::after(Duration::from_secs(60)).await;
        }
    }
    info!("sensor initialized, polling every {} ms", POLL_INTERVAL_MS);

    let mut delay = Delay;
    let fault = pipeline::run_producer(
        &mut sensor,
        &SAMPLE_QUEUE,
        &mut delay,
        || Instant::now().as_millis(),
        &SAMPLES_DROPPED,
        POLL_INTERVAL_MS,
    )
    .await;

    error!("sensor task faulted: {:?}", Debug2Format(&fault));
    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}

// ============================================================================
// SD writer task — drain queue, append CSV, sync per record
// ============================================================================

/// FAT timestamps from uptime (no RTC on this board): base 2025-01-01
/// plus time since boot, so entries still sort in creation order.
struct UptimeTimeSource;

impl TimeSource for UptimeTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        let uptime_secs = Instant::now().as_secs();
        let days = uptime_secs / 86400;
        let rem = uptime_secs % 86400;
        let month = (1 + (days / 28) % 12) as u8;
        let day = (1 + days % 28) as u8;
        let hours = (rem / 3600) as u8;
        let minutes = ((rem % 3600) / 60) as u8;
        let seconds = (rem % 60) as u8;
        Timestamp::from_calendar(2025, month, day, hours, minutes, seconds)
            .unwrap_or(Timestamp::from_calendar(2025, 1, 1, 0, 0, 0).unwrap())
    }
}

/// Encodes records as CSV lines into the open log file, one flush per
/// record so a power cut costs at most the newest sample.
struct SdCsvSink<'a> {
    volume_mgr: &'a CardVolumeManager,
    file: RawFile,
}

impl RecordSink for SdCsvSink<'_> {
    type Error = embedded_sdmmc::Error<SdError<spi::Error>>;

    fn append(&mut self, record: &SampleRecord) -> Result<(), Self::Error> {
        let mut buf = [0u8; MAX_RECORD_LEN];
        let n = encode_csv(record, &mut buf);
        self.volume_mgr.write(self.file, &buf[..n])
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        self.volume_mgr.flush_file(self.file)
    }
}

#[embassy_executor::task]
async fn sd_writer_task(spi: SdBus, cs: SdCs) {
    info!("sd writer task started");

    let mut card = SdSpi::new(spi, cs, Delay);

    // protocol driver does no internal retries; retry the handshake here
    let mut init_ok = false;
    for attempt in 1..=SD_INIT_RETRIES {
        info!("card init attempt {}/{}", attempt, SD_INIT_RETRIES);
        match card.initialize() {
            Ok(()) => {
                init_ok = true;
                break;
            }
            Err(e) => {
                warn!("card init failed: {:?}", Debug2Format(&e));
                card.mark_uninitialized();
                Timer::after(Duration::from_millis(500)).await;
            }
        }
    }
    if !init_ok {
        error!("card init failed after {} attempts", SD_INIT_RETRIES);
        loop {
            Timer::after(Duration::from_secs(60)).await;
        }
    }

    // handshake done at 400 kHz: raise the bus to the working rate
    card.bus_mut().set_frequency(SD_SPI_WORK_FREQ);
    info!("card initialized, SPI at {} Hz", SD_SPI_WORK_FREQ);

    let volume_mgr = VolumeManager::new(SdBlockDevice::new(card), UptimeTimeSource);

    let raw_volume = match volume_mgr.open_raw_volume(VolumeIdx(0)) {
        Ok(v) => v,
        Err(e) => {
            error!("failed to open volume: {:?}", Debug2Format(&e));
            loop {
                Timer::after(Duration::from_secs(60)).await;
            }
        }
    };
    let root_dir = match volume_mgr.open_root_dir(raw_volume) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to open root dir: {:?}", Debug2Format(&e));
            loop {
                Timer::after(Duration::from_secs(60)).await;
            }
        }
    };
    let file = match volume_mgr.open_file_in_dir(root_dir, LOG_FILE_NAME, Mode::ReadWriteCreateOrAppend)
    {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open {}: {:?}", LOG_FILE_NAME, Debug2Format(&e));
            loop {
                Timer::after(Duration::from_secs(60)).await;
            }
        }
    };
    info!("appending to {}", LOG_FILE_NAME);

    let mut sink = SdCsvSink {
        volume_mgr: &volume_mgr,
        file,
    };
    let fault = pipeline::run_consumer(&mut sink, &SAMPLE_QUEUE).await;

    error!("sd writer task faulted: {:?}", Debug2Format(&fault));
    let _ = volume_mgr.close_file(file);
    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}
