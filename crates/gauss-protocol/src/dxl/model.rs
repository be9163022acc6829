//! 电机型号与控制表

use std::f64::consts::PI;

/// 控制表地址
///
/// `(address, len)` 形式，长度单位字节。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTable {
    pub model_number: (u16, u16),
    pub firmware_version: (u16, u16),
    pub torque_enable: (u16, u16),
    pub led: (u16, u16),
    pub goal_position: (u16, u16),
    /// XL-320: Moving Speed；XL-430: Profile Velocity
    pub moving_speed: (u16, u16),
    /// XL-320: Torque Limit；XL-430: Goal PWM
    pub torque_limit: (u16, u16),
    pub present_position: (u16, u16),
    pub present_voltage: (u16, u16),
    pub present_temperature: (u16, u16),
    pub hardware_error: (u16, u16),
}

const XL320_TABLE: ControlTable = ControlTable {
    model_number: (0, 2),
    firmware_version: (2, 1),
    torque_enable: (24, 1),
    led: (25, 1),
    goal_position: (30, 2),
    moving_speed: (32, 2),
    torque_limit: (35, 2),
    present_position: (37, 2),
    present_voltage: (45, 1),
    present_temperature: (46, 1),
    hardware_error: (50, 1),
};

const XL430_TABLE: ControlTable = ControlTable {
    model_number: (0, 2),
    firmware_version: (6, 1),
    torque_enable: (64, 1),
    led: (65, 1),
    goal_position: (116, 4),
    moving_speed: (112, 4),
    torque_limit: (100, 2),
    present_position: (132, 4),
    present_voltage: (144, 2),
    present_temperature: (146, 1),
    hardware_error: (70, 1),
};

/// 支持的 Dynamixel 型号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorModel {
    /// 10-bit 位置，300° 量程
    Xl320,
    /// 12-bit 位置，360° 量程
    Xl430,
}

impl MotorModel {
    pub fn from_model_number(number: u16) -> Option<Self> {
        match number {
            350 => Some(Self::Xl320),
            1060 => Some(Self::Xl430),
            _ => None,
        }
    }

    pub fn model_number(self) -> u16 {
        match self {
            Self::Xl320 => 350,
            Self::Xl430 => 1060,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Xl320 => "XL-320",
            Self::Xl430 => "XL-430",
        }
    }

    pub fn table(self) -> &'static ControlTable {
        match self {
            Self::Xl320 => &XL320_TABLE,
            Self::Xl430 => &XL430_TABLE,
        }
    }

    /// 最大位置值
    pub fn max_position(self) -> u32 {
        match self {
            Self::Xl320 => 1023,
            Self::Xl430 => 4095,
        }
    }

    /// 零位对应的位置值
    pub fn center_position(self) -> u32 {
        match self {
            Self::Xl320 => 512,
            Self::Xl430 => 2048,
        }
    }

    /// 每个位置单位对应的弧度
    pub fn rad_per_tick(self) -> f64 {
        match self {
            Self::Xl320 => (300.0_f64).to_radians() / 1024.0,
            Self::Xl430 => 2.0 * PI / 4096.0,
        }
    }

    /// 位置值 → 弧度（相对零位）
    pub fn ticks_to_rad(self, ticks: u32) -> f64 {
        (ticks as f64 - self.center_position() as f64) * self.rad_per_tick()
    }

    /// 弧度 → 位置值，超出量程时截断
    pub fn rad_to_ticks(self, rad: f64) -> u32 {
        let ticks = (rad / self.rad_per_tick()).round() + self.center_position() as f64;
        ticks.clamp(0.0, self.max_position() as f64) as u32
    }

    /// 电压寄存器单位 0.1V
    pub fn raw_to_volts(self, raw: u32) -> f64 {
        raw as f64 / 10.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_numbers() {
        assert_eq!(MotorModel::from_model_number(350), Some(MotorModel::Xl320));
        assert_eq!(MotorModel::from_model_number(1060), Some(MotorModel::Xl430));
        assert_eq!(MotorModel::from_model_number(12), None);
    }

    #[test]
    fn test_center_is_zero_rad() {
        assert_eq!(MotorModel::Xl320.rad_to_ticks(0.0), 512);
        assert_eq!(MotorModel::Xl430.rad_to_ticks(0.0), 2048);
        assert_eq!(MotorModel::Xl430.ticks_to_rad(2048), 0.0);
    }

    #[test]
    fn test_rad_to_ticks_clamps() {
        assert_eq!(MotorModel::Xl320.rad_to_ticks(10.0), 1023);
        assert_eq!(MotorModel::Xl430.rad_to_ticks(-10.0), 0);
    }

    #[test]
    fn test_conversion_precision() {
        let model = MotorModel::Xl430;
        let rad = 0.5;
        let back = model.ticks_to_rad(model.rad_to_ticks(rad));
        assert!((back - rad).abs() <= model.rad_per_tick());
    }
}
