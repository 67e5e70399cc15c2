//! BME680 environmental sensor driver (I2C, forced-measurement mode).
//!
//! One `poll` triggers a single-shot conversion and compensates the four
//! raw channels with the datasheet's integer-only formulas. Pressure and
//! humidity compensation depend on the fine-temperature value produced by
//! temperature compensation, so the order inside a cycle is fixed:
//! temperature, pressure, humidity, gas resistance.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::config;
use crate::pipeline::SampleSource;
use crate::record::Measurements;

/// Register map (datasheet section 5.3)
mod regs {
    pub const RES_HEAT_VAL: u8 = 0x00;
    pub const RES_HEAT_RANGE: u8 = 0x02; /* only <5:4> */
    pub const RANGE_SW_ERR: u8 = 0x04;
    /// new_data_0<7> gas_measuring<6> measuring<5> gas_meas_index_0<3:0>
    pub const EAS_STATUS_0: u8 = 0x1D;
    pub const PRESS_MSB: u8 = 0x1F;
    pub const PRESS_LSB: u8 = 0x20;
    pub const PRESS_XLSB: u8 = 0x21; /* only <7:4> */
    pub const TEMP_MSB: u8 = 0x22;
    pub const TEMP_LSB: u8 = 0x23;
    pub const TEMP_XLSB: u8 = 0x24; /* only <7:4> */
    pub const HUM_MSB: u8 = 0x25;
    pub const HUM_LSB: u8 = 0x26;
    /// gas_r<9:2>
    pub const GAS_R_MSB: u8 = 0x2A;
    /// gas_r<1:0> in <7:6>, gas_range_r<3:0>
    pub const GAS_R_LSB: u8 = 0x2B;
    pub const RES_HEAT_0: u8 = 0x5A;
    pub const GAS_WAIT_0: u8 = 0x64;
    /// run_gas<4> nb_conv<3:0>
    pub const CTRL_GAS_1: u8 = 0x71;
    /// spi_3w_int_en<6> osrs_h<2:0>
    pub const CTRL_HUM: u8 = 0x72;
    /// osrs_t<7:5> osrs_p<4:2> mode<1:0>
    pub const CTRL_MEAS: u8 = 0x74;
    pub const CHIP_ID: u8 = 0xD0;

    /* calibration parameters */
    pub const PAR_T1_LSB: u8 = 0xE9;
    pub const PAR_T1_MSB: u8 = 0xEA;
    pub const PAR_T2_LSB: u8 = 0x8A;
    pub const PAR_T2_MSB: u8 = 0x8B;
    pub const PAR_T3: u8 = 0x8C;
    pub const PAR_P1_LSB: u8 = 0x8E;
    pub const PAR_P1_MSB: u8 = 0x8F;
    pub const PAR_P2_LSB: u8 = 0x90;
    pub const PAR_P2_MSB: u8 = 0x91;
    pub const PAR_P3: u8 = 0x92;
    pub const PAR_P4_LSB: u8 = 0x94;
    pub const PAR_P4_MSB: u8 = 0x95;
    pub const PAR_P5_LSB: u8 = 0x96;
    pub const PAR_P5_MSB: u8 = 0x97;
    pub const PAR_P6: u8 = 0x99;
    pub const PAR_P7: u8 = 0x98;
    pub const PAR_P8_LSB: u8 = 0x9C;
    pub const PAR_P8_MSB: u8 = 0x9D;
    pub const PAR_P9_LSB: u8 = 0x9E;
    pub const PAR_P9_MSB: u8 = 0x9F;
    pub const PAR_P10: u8 = 0xA0;
    pub const PAR_H1_LSB: u8 = 0xE2; /* <3:0> */
    pub const PAR_H1_MSB: u8 = 0xE3;
    pub const PAR_H2_LSB: u8 = 0xE2; /* <7:4> */
    pub const PAR_H2_MSB: u8 = 0xE1;
    pub const PAR_H3: u8 = 0xE4;
    pub const PAR_H4: u8 = 0xE5;
    pub const PAR_H5: u8 = 0xE6;
    pub const PAR_H6: u8 = 0xE7;
    pub const PAR_H7: u8 = 0xE8;
    pub const PAR_G1: u8 = 0xED;
    pub const PAR_G2_LSB: u8 = 0xEB;
    pub const PAR_G2_MSB: u8 = 0xEC;
    pub const PAR_G3: u8 = 0xEE;
}

/// Oversampling: humidity ×1, temperature ×2, pressure ×16
const OVERSAMPLE_H: u8 = 0b001;
const OVERSAMPLE_T: u8 = 0b010;
const OVERSAMPLE_P: u8 = 0b101;

/// CTRL_MEAS mode<1:0>: trigger one conversion, then back to sleep
const MODE_FORCED: u8 = 0b01;
/// CTRL_GAS_1: enable gas measurement, profile index 0
const RUN_GAS: u8 = 1 << 4;
/// GAS_WAIT_0 code for a 100 ms heat-up
const HEATER_WAIT_CODE: u8 = 0x59;

const STATUS_NEW_DATA: u8 = 1 << 7;
const STATUS_MEASURING: u8 = 1 << 5;

/// Errors from the sensor driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError<E> {
    /// Register read or write failed on the underlying bus.
    Bus(E),
    /// `poll` called before `initialize`.
    NotInitialized,
    /// `initialize` called twice.
    AlreadyInitialized,
}

/// Calibration coefficients, read once at init and immutable afterwards.
/// Signedness follows the datasheet; several 16-bit values are split
/// across non-adjacent registers and `par_h1`/`par_h2` share the nibbles
/// of register 0xE2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Calibration {
    /* temperature */
    pub par_t1: u16,
    pub par_t2: i16,
    pub par_t3: i8,
    /* pressure */
    pub par_p1: u16,
    pub par_p2: i16,
    pub par_p3: i8,
    pub par_p4: i16,
    pub par_p5: i16,
    pub par_p6: i8,
    pub par_p7: i8,
    pub par_p8: i16,
    pub par_p9: i16,
    pub par_p10: u8,
    /* humidity */
    pub par_h1: u16,
    pub par_h2: u16,
    pub par_h3: i8,
    pub par_h4: i8,
    pub par_h5: i8,
    pub par_h6: u8,
    pub par_h7: i8,
    /* gas heater */
    pub par_g1: i8,
    pub par_g2: i16,
    pub par_g3: i8,
}

/// BME680 on an I2C bus. Owns the bus handle and a delay provider.
pub struct Bme680<I2C, D> {
    i2c: I2C,
    delay: D,
    addr: u8,
    calib: Calibration,
    output: Measurements,
    t_fine: i32,
    amb_temp: i32,
    old_amb_temp: i32,
    target_temp: i32,
    res_heat_0: u8,
    initialized: bool,
}

impl<I2C, D> Bme680<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, delay: D, addr: u8) -> Self {
        Self {
            i2c,
            delay,
            addr,
            calib: Calibration::default(),
            output: Measurements::UNSET,
            t_fine: 0,
            amb_temp: config::INITIAL_AMBIENT_C,
            old_amb_temp: config::INITIAL_AMBIENT_C,
            target_temp: config::TARGET_HEATER_TEMP_C,
            res_heat_0: 0,
            initialized: false,
        }
    }

    /// Latest compensated readings. Only meaningful after a successful
    /// `poll`; a failed poll leaves the previous values in place and the
    /// caller must not consume them as fresh data.
    pub fn output(&self) -> Measurements {
        self.output
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calib
    }

    /// Current heater set-point code (RES_HEAT_0).
    pub fn heater_code(&self) -> u8 {
        self.res_heat_0
    }

    /// Probe the device and program it: calibration decode, oversampling,
    /// heater wait and set-point, gas measurement enable.
    pub fn initialize(&mut self) -> Result<(), SensorError<I2C::Error>> {
        if self.initialized {
            return Err(SensorError::AlreadyInitialized);
        }

        // a successful register read is proof the device answers
        self.read_reg(regs::CHIP_ID)?;

        self.output = Measurements::UNSET;
        self.amb_temp = config::INITIAL_AMBIENT_C;
        self.old_amb_temp = config::INITIAL_AMBIENT_C;
        self.target_temp = config::TARGET_HEATER_TEMP_C;

        self.calib = self.read_calibration()?;

        self.write_reg(regs::CTRL_HUM, OVERSAMPLE_H)?;
        // mode bits stay 0b00: sleep until the first poll
        self.write_reg(regs::CTRL_MEAS, (OVERSAMPLE_P << 2) | (OVERSAMPLE_T << 5))?;
        self.write_reg(regs::GAS_WAIT_0, HEATER_WAIT_CODE)?;
        self.update_heater()?;
        self.write_reg(regs::CTRL_GAS_1, RUN_GAS)?;

        self.initialized = true;
        Ok(())
    }

    /// Run one forced measurement and refresh all four output channels.
    pub fn poll(&mut self) -> Result<(), SensorError<I2C::Error>> {
        if !self.initialized {
            return Err(SensorError::NotInitialized);
        }

        let ctrl_meas = self.read_reg(regs::CTRL_MEAS)?;
        self.write_reg(regs::CTRL_MEAS, ctrl_meas | MODE_FORCED)?;

        // cover the programmed heat-up before watching the status register
        self.delay.delay_ms(config::MEASURE_SETTLE_MS);
        loop {
            let status = self.read_reg(regs::EAS_STATUS_0)?;
            if status & STATUS_NEW_DATA != 0 && status & STATUS_MEASURING == 0 {
                break;
            }
            self.delay.delay_ms(config::STATUS_POLL_MS);
        }

        self.update_temperature()?;
        self.update_pressure()?;
        self.update_humidity()?;
        self.update_gas_resistance()?;

        // re-aim the heater once the ambient estimate moves
        if self.amb_temp != self.old_amb_temp {
            self.update_heater()?;
        }

        Ok(())
    }

    fn update_temperature(&mut self) -> Result<(), SensorError<I2C::Error>> {
        let msb = self.read_reg(regs::TEMP_MSB)?;
        let lsb = self.read_reg(regs::TEMP_LSB)?;
        let xlsb = self.read_reg(regs::TEMP_XLSB)?;
        let temp_adc = ((msb as u32) << 12) | ((lsb as u32) << 4) | ((xlsb as u32) >> 4);

        let (temp_comp, t_fine) = calc::compensate_temperature(&self.calib, temp_adc);
        self.t_fine = t_fine;
        self.output.temperature = temp_comp;

        self.old_amb_temp = self.amb_temp;
        self.amb_temp = temp_comp;
        Ok(())
    }

    fn update_pressure(&mut self) -> Result<(), SensorError<I2C::Error>> {
        let msb = self.read_reg(regs::PRESS_MSB)?;
        let lsb = self.read_reg(regs::PRESS_LSB)?;
        let xlsb = self.read_reg(regs::PRESS_XLSB)?;
        let press_adc = ((msb as u32) << 12) | ((lsb as u32) << 4) | ((xlsb as u32) >> 4);

        self.output.pressure = calc::compensate_pressure(&self.calib, press_adc, self.t_fine);
        Ok(())
    }

    fn update_humidity(&mut self) -> Result<(), SensorError<I2C::Error>> {
        let msb = self.read_reg(regs::HUM_MSB)?;
        let lsb = self.read_reg(regs::HUM_LSB)?;
        let hum_adc = ((msb as u16) << 8) | lsb as u16;

        self.output.humidity =
            calc::compensate_humidity(&self.calib, hum_adc, self.output.temperature);
        Ok(())
    }

    fn update_gas_resistance(&mut self) -> Result<(), SensorError<I2C::Error>> {
        let msb = self.read_reg(regs::GAS_R_MSB)?;
        let lsb = self.read_reg(regs::GAS_R_LSB)?;
        let gas_adc = ((msb as u16) << 2) | (((lsb as u16) >> 6) & 0x3);
        let gas_range = lsb & 0x0F;
        let range_sw_err = self.read_reg(regs::RANGE_SW_ERR)? & 0x0F;

        self.output.gas_resistance =
            calc::compensate_gas_resistance(gas_adc, gas_range, range_sw_err);
        Ok(())
    }

    /// Recompute the heater set-point for the current ambient estimate and
    /// write it to RES_HEAT_0.
    fn update_heater(&mut self) -> Result<(), SensorError<I2C::Error>> {
        let res_heat_range = (self.read_reg(regs::RES_HEAT_RANGE)? >> 4) & 0x03;
        let res_heat_val = self.read_reg(regs::RES_HEAT_VAL)? as i8;

        self.res_heat_0 = calc::heater_resistance_code(
            &self.calib,
            self.amb_temp,
            self.target_temp,
            res_heat_range,
            res_heat_val,
        );
        self.write_reg(regs::RES_HEAT_0, self.res_heat_0)
    }

    fn read_calibration(&mut self) -> Result<Calibration, SensorError<I2C::Error>> {
        let mut calib = Calibration::default();

        calib.par_t1 = self.read_split_u16(regs::PAR_T1_MSB, regs::PAR_T1_LSB)?;
        calib.par_t2 = self.read_split_u16(regs::PAR_T2_MSB, regs::PAR_T2_LSB)? as i16;
        calib.par_t3 = self.read_reg(regs::PAR_T3)? as i8;

        calib.par_p1 = self.read_split_u16(regs::PAR_P1_MSB, regs::PAR_P1_LSB)?;
        calib.par_p2 = self.read_split_u16(regs::PAR_P2_MSB, regs::PAR_P2_LSB)? as i16;
        calib.par_p3 = self.read_reg(regs::PAR_P3)? as i8;
        calib.par_p4 = self.read_split_u16(regs::PAR_P4_MSB, regs::PAR_P4_LSB)? as i16;
        calib.par_p5 = self.read_split_u16(regs::PAR_P5_MSB, regs::PAR_P5_LSB)? as i16;
        calib.par_p6 = self.read_reg(regs::PAR_P6)? as i8;
        calib.par_p7 = self.read_reg(regs::PAR_P7)? as i8;
        calib.par_p8 = self.read_split_u16(regs::PAR_P8_MSB, regs::PAR_P8_LSB)? as i16;
        calib.par_p9 = self.read_split_u16(regs::PAR_P9_MSB, regs::PAR_P9_LSB)? as i16;
        calib.par_p10 = self.read_reg(regs::PAR_P10)?;

        // par_h1<3:0> and par_h2<3:0> share register 0xE2
        let h1_lsb = self.read_reg(regs::PAR_H1_LSB)?;
        let h1_msb = self.read_reg(regs::PAR_H1_MSB)?;
        calib.par_h1 = (h1_lsb as u16 & 0x0F) | ((h1_msb as u16) << 4);
        let h2_lsb = self.read_reg(regs::PAR_H2_LSB)?;
        let h2_msb = self.read_reg(regs::PAR_H2_MSB)?;
        calib.par_h2 = ((h2_lsb as u16 >> 4) & 0x0F) | ((h2_msb as u16) << 4);
        calib.par_h3 = self.read_reg(regs::PAR_H3)? as i8;
        calib.par_h4 = self.read_reg(regs::PAR_H4)? as i8;
        calib.par_h5 = self.read_reg(regs::PAR_H5)? as i8;
        calib.par_h6 = self.read_reg(regs::PAR_H6)?;
        calib.par_h7 = self.read_reg(regs::PAR_H7)? as i8;

        calib.par_g1 = self.read_reg(regs::PAR_G1)? as i8;
        calib.par_g2 = self.read_split_u16(regs::PAR_G2_MSB, regs::PAR_G2_LSB)? as i16;
        calib.par_g3 = self.read_reg(regs::PAR_G3)? as i8;

        Ok(calib)
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, SensorError<I2C::Error>> {
        let mut buf = [0u8; 1];
        self.i2c
            .write_read(self.addr, &[reg], &mut buf)
            .map_err(SensorError::Bus)?;
        Ok(buf[0])
    }

    /// 16-bit parameter split across two (not necessarily adjacent)
    /// register addresses, LSB first.
    fn read_split_u16(&mut self, msb: u8, lsb: u8) -> Result<u16, SensorError<I2C::Error>> {
        let lo = self.read_reg(lsb)?;
        let hi = self.read_reg(msb)?;
        Ok((lo as u16) | ((hi as u16) << 8))
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), SensorError<I2C::Error>> {
        self.i2c
            .write(self.addr, &[reg, value])
            .map_err(SensorError::Bus)
    }
}

impl<I2C, D> SampleSource for Bme680<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    type Error = SensorError<I2C::Error>;

    fn sample(&mut self) -> Result<Measurements, Self::Error> {
        self.poll()?;
        Ok(self.output)
    }
}

pub mod calc {
    //! The datasheet's fixed-point compensation procedures. Pure functions
    //! of the raw ADC fields and the calibration set; every shift amount,
    //! division point and signedness is the published integer sequence.

    use super::Calibration;

    /// Per-range constants for gas resistance (datasheet table, verbatim).
    pub const GAS_RANGE_CONST1: [u32; 16] = [
        2147483647, 2147483647, 2147483647, 2147483647, 2147483647, 2126008810, 2147483647,
        2130303777, 2147483647, 2147483647, 2143188679, 2136746228, 2147483647, 2126008810,
        2147483647, 2147483647,
    ];
    pub const GAS_RANGE_CONST2: [u32; 16] = [
        4096000000, 2048000000, 1024000000, 512000000, 255744255, 127110228, 64000000, 32258064,
        16016016, 8000000, 4000000, 2000000, 1000000, 500000, 250000, 125000,
    ];

    /// Returns `(temperature in 0.01 °C, t_fine)`. `t_fine` feeds the
    /// pressure and humidity compensation of the same cycle.
    pub fn compensate_temperature(calib: &Calibration, temp_adc: u32) -> (i32, i32) {
        let var1 = ((temp_adc as i32) >> 3) - ((calib.par_t1 as i32) << 1);
        let var2 = (var1 * (calib.par_t2 as i32)) >> 11;
        let var3 = ((((var1 >> 1) * (var1 >> 1)) >> 12) * ((calib.par_t3 as i32) << 4)) >> 14;
        let t_fine = var2 + var3;
        let temp_comp = ((t_fine * 5) + 128) >> 8;
        (temp_comp, t_fine)
    }

    /// Pressure in Pa.
    pub fn compensate_pressure(calib: &Calibration, press_adc: u32, t_fine: i32) -> i32 {
        let mut var1 = (t_fine >> 1) - 64000;
        let mut var2 = ((((var1 >> 2) * (var1 >> 2)) >> 11) * (calib.par_p6 as i32)) >> 2;
        var2 += (var1 * (calib.par_p5 as i32)) << 1;
        var2 = (var2 >> 2) + ((calib.par_p4 as i32) << 16);
        var1 = (((((var1 >> 2) * (var1 >> 2)) >> 13) * ((calib.par_p3 as i32) << 5)) >> 3)
            + (((calib.par_p2 as i32) * var1) >> 1);
        var1 >>= 18;
        var1 = ((32768 + var1) * (calib.par_p1 as i32)) >> 15;
        if var1 == 0 {
            return 0;
        }

        let press_comp = 1_048_576 - press_adc as i32;
        // the middle section runs in unsigned arithmetic
        let mut press_comp =
            (press_comp.wrapping_sub(var2 >> 12) as u32).wrapping_mul(3125) as i32;
        if press_comp >= 1 << 30 {
            press_comp = (((press_comp as u32) / (var1 as u32)) << 1) as i32;
        } else {
            press_comp = (((press_comp << 1) as u32) / (var1 as u32)) as i32;
        }

        let var1 =
            ((calib.par_p9 as i32) * (((press_comp >> 3) * (press_comp >> 3)) >> 13)) >> 12;
        let var2 = ((press_comp >> 2) * (calib.par_p8 as i32)) >> 13;
        // the cube can wrap at the top of the measurement range, exactly
        // as the reference arithmetic does
        let var3 = (press_comp >> 8)
            .wrapping_mul(press_comp >> 8)
            .wrapping_mul(press_comp >> 8)
            .wrapping_mul(calib.par_p10 as i32)
            >> 17;
        press_comp + ((var1 + var2 + var3 + ((calib.par_p7 as i32) << 7)) >> 4)
    }

    /// Relative humidity in milli-%RH. Takes the compensated temperature
    /// of the same cycle (0.01 °C).
    pub fn compensate_humidity(calib: &Calibration, hum_adc: u16, temp_comp: i32) -> i32 {
        let temp_scaled = temp_comp;
        let var1 = hum_adc as i32
            - ((calib.par_h1 as i32) << 4)
            - (((temp_scaled * (calib.par_h3 as i32)) / 100) >> 1);
        let var2 = ((calib.par_h2 as i32)
            * (((temp_scaled * (calib.par_h4 as i32)) / 100)
                + (((temp_scaled * ((temp_scaled * (calib.par_h5 as i32)) / 100)) >> 6) / 100)
                + (1 << 14)))
            >> 10;
        let var3 = var1 * var2;
        let var4 =
            (((calib.par_h6 as i32) << 7) + ((temp_scaled * (calib.par_h7 as i32)) / 100)) >> 4;
        let var5 = ((var3 >> 14) * (var3 >> 14)) >> 10;
        let var6 = (var4 * var5) >> 1;
        (((var3 + var6) >> 10) * 1000) >> 12
    }

    /// Gas resistance in Ω. `gas_range` selects one entry of each lookup
    /// table; it comes from a 4-bit field, so masking keeps every possible
    /// value inside the tables. `range_switching_error` is the low nibble
    /// of register 0x04.
    pub fn compensate_gas_resistance(gas_adc: u16, gas_range: u8, range_switching_error: u8) -> i32 {
        let range = (gas_range & 0x0F) as usize;
        let var1 = ((1340 + 5 * range_switching_error as i64)
            * GAS_RANGE_CONST1[range] as i64)
            >> 16;
        let var2 = ((gas_adc as i64) << 15) - (1 << 24) + var1;
        ((((GAS_RANGE_CONST2[range] as i64 * var1) >> 9) + (var2 >> 1)) / var2) as i32
    }

    /// Heater set-point code for RES_HEAT_0 (datasheet page 21).
    /// `res_heat_range` is register 0x02 bits <5:4>, `res_heat_val` the
    /// signed byte at register 0x00.
    pub fn heater_resistance_code(
        calib: &Calibration,
        amb_temp: i32,
        target_temp: i32,
        res_heat_range: u8,
        res_heat_val: i8,
    ) -> u8 {
        let var1 = ((amb_temp * calib.par_g3 as i32) / 10) << 8;
        let var2 = (calib.par_g1 as i32 + 784)
            * (((((calib.par_g2 as i32 + 154009) * target_temp * 5) / 100) + 3276800) / 10);
        let var3 = var1 + (var2 >> 1);
        let var4 = var3 / (res_heat_range as i32 + 4);
        let var5 = (131 * res_heat_val as i32) + 65536;
        let res_heat_x100 = ((var4 / var5) - 250) * 34;
        ((res_heat_x100 + 50) / 100) as u8
    }
}
