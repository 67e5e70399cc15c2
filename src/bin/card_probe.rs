//! Minimal card probe — just the SD init handshake and a sector-0 read,
//! nothing else. If this works, a logger problem is above the protocol
//! layer (filesystem or wiring of the sensor side).

#![no_std]
#![no_main]

use bme680_logger::config::SD_SPI_INIT_FREQ;
use bme680_logger::sdspi::SdSpi;

use defmt::*;
use embassy_executor::Spawner;
use embassy_rp::gpio::{Level, Output};
use embassy_rp::spi::{self, Spi};
use embassy_time::{Delay, Duration, Timer};

use {defmt_rtt as _, panic_probe as _};

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    let mut spi_config = spi::Config::default();
    spi_config.frequency = SD_SPI_INIT_FREQ;
    let spi = Spi::new_blocking(p.SPI1, p.PIN_10, p.PIN_11, p.PIN_12, spi_config);
    let cs = Output::new(p.PIN_13, Level::High);

    let mut card = SdSpi::new(spi, cs, Delay);

    loop {
        match card.initialize() {
            Ok(()) => {
                let mut sector = [0u8; 512];
                match card.read_block(0, &mut sector) {
                    Ok(()) => info!(
                        "card ok, sector 0 trailer: {} {} (expect 85 170)",
                        sector[510], sector[511]
                    ),
                    Err(e) => error!("sector read failed: {:?}", Debug2Format(&e)),
                }
            }
            Err(e) => error!("card init failed: {:?}", Debug2Format(&e)),
        }
        card.mark_uninitialized();
        Timer::after(Duration::from_secs(5)).await;
    }
}
