//! Configuration constants for the environmental logger

/// Sensor poll period (one forced measurement per period)
pub const POLL_INTERVAL_MS: u32 = 5000;

/// Log file in the card's root directory, one CSV record per sample
pub const LOG_FILE_NAME: &str = "DATA.CSV";

/// Capacity of the producer→consumer sample queue
pub const SAMPLE_QUEUE_DEPTH: usize = 8;

/// BME680 7-bit I2C address (SDO pulled low)
pub const BME680_ADDR: u8 = 0x76;

/// Gas heater plate set-point (°C)
pub const TARGET_HEATER_TEMP_C: i32 = 300;

/// Ambient temperature assumed before the first measurement (°C)
pub const INITIAL_AMBIENT_C: i32 = 25;

/// Wait after triggering a forced measurement (covers the 100 ms heater
/// heat-up programmed into GAS_WAIT_0)
pub const MEASURE_SETTLE_MS: u32 = 100;

/// Delay between EAS_STATUS reads while waiting for new data
pub const STATUS_POLL_MS: u32 = 10;

/// Byte exchanges to poll for a command response (R1 top bit clear)
pub const SD_RESPONSE_ATTEMPTS: u32 = 10;

/// ACMD41 attempts before giving up on card init
pub const SD_INIT_ATTEMPTS: u32 = 1000;

/// Pacing delay between ACMD41 attempts
pub const SD_INIT_PACING_MS: u32 = 1;

/// Byte exchanges to wait for the 0xFE data token on reads
pub const SD_TOKEN_ATTEMPTS: u32 = 1000;

/// Byte exchanges to wait for the busy token to clear after writes
pub const SD_BUSY_ATTEMPTS: u32 = 1000;

/// SD SPI initialization frequency (slow for card init)
pub const SD_SPI_INIT_FREQ: u32 = 400_000;

/// SD SPI working frequency after init
pub const SD_SPI_WORK_FREQ: u32 = 16_000_000;

/// Card init attempts before the storage task gives up
pub const SD_INIT_RETRIES: u8 = 3;
