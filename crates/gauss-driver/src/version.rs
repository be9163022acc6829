//! 硬件版本映射表
//!
//! 每个硬件版本一份静态数据：6 个逻辑关节槽位分别由哪条总线的第几个电机驱动、
//! 各总线上的电机描述，以及总线被禁用时对应槽位的替代位置。
//!
//! | 版本 | CAN 步进电机 | Dynamixel |
//! |------|-------------|-----------|
//! | V1   | 槽位 1-4（ID 1-4） | 槽位 5-6：XL-320 ID 4, 5 |
//! | V2   | 槽位 1-3（ID 1-3） | 槽位 4-6：XL-430 ID 2, 3 + XL-320 ID 6 |

use crate::error::HardwareError;
use crate::state::{BusKind, JOINT_COUNT, JointPose};
use gauss_protocol::MotorModel;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// 单条总线上的子位姿（最多 4 个关节，栈上存放）
pub type SubPose = SmallVec<[f64; 4]>;

/// 硬件版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareVersion {
    V1 = 1,
    V2 = 2,
}

impl TryFrom<i32> for HardwareVersion {
    type Error = HardwareError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HardwareVersion::V1),
            2 => Ok(HardwareVersion::V2),
            other => Err(HardwareError::Configuration(format!(
                "unknown hardware version {}",
                other
            ))),
        }
    }
}

/// 逻辑槽位 → (总线, 总线内下标)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointSlot {
    pub bus: BusKind,
    pub local_index: usize,
}

const fn can(local_index: usize) -> JointSlot {
    JointSlot {
        bus: BusKind::Can,
        local_index,
    }
}

const fn dxl(local_index: usize) -> JointSlot {
    JointSlot {
        bus: BusKind::Dxl,
        local_index,
    }
}

/// 步进电机：1.8° 步距角，8 细分
const MICROSTEPS_PER_REV: f64 = 200.0 * 8.0;

/// CAN 总线上的步进电机
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepperSpec {
    pub motor_id: u8,
    pub name: &'static str,
    /// 减速比（电机转数 / 关节转数）
    pub gear_ratio: f64,
    /// 安装方向（1 或 -1）
    pub direction: i8,
}

impl StepperSpec {
    pub fn steps_per_rad(&self) -> f64 {
        MICROSTEPS_PER_REV * self.gear_ratio / (2.0 * PI)
    }

    pub fn rad_to_steps(&self, rad: f64) -> i32 {
        (rad * self.direction as f64 * self.steps_per_rad()).round() as i32
    }

    pub fn steps_to_rad(&self, steps: i32) -> f64 {
        steps as f64 * self.direction as f64 / self.steps_per_rad()
    }
}

/// Dynamixel 总线上的关节执行器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoSpec {
    pub id: u8,
    pub name: &'static str,
    pub model: MotorModel,
    pub direction: i8,
}

impl ServoSpec {
    pub fn rad_to_ticks(&self, rad: f64) -> u32 {
        self.model.rad_to_ticks(rad * self.direction as f64)
    }

    pub fn ticks_to_rad(&self, ticks: u32) -> f64 {
        self.model.ticks_to_rad(ticks) * self.direction as f64
    }
}

/// 某个硬件版本的完整映射
#[derive(Debug, PartialEq)]
pub struct JointMapping {
    pub version: HardwareVersion,
    pub slots: [JointSlot; JOINT_COUNT],
    pub steppers: &'static [StepperSpec],
    pub servos: &'static [ServoSpec],
    /// CAN 总线禁用时的替代位置（按步进电机顺序）
    pub can_fallback: &'static [f64],
    /// DXL 总线禁用时的替代位置（按执行器顺序）
    pub dxl_fallback: &'static [f64],
}

static V1_STEPPERS: [StepperSpec; 4] = [
    StepperSpec {
        motor_id: 1,
        name: "Axis 1",
        gear_ratio: 6.4,
        direction: -1,
    },
    StepperSpec {
        motor_id: 2,
        name: "Axis 2",
        gear_ratio: 9.0,
        direction: -1,
    },
    StepperSpec {
        motor_id: 3,
        name: "Axis 3",
        gear_ratio: 7.0,
        direction: 1,
    },
    StepperSpec {
        motor_id: 4,
        name: "Axis 4",
        gear_ratio: 5.5,
        direction: -1,
    },
];

static V1_SERVOS: [ServoSpec; 2] = [
    ServoSpec {
        id: 4,
        name: "Axis 5",
        model: MotorModel::Xl320,
        direction: 1,
    },
    ServoSpec {
        id: 5,
        name: "Axis 6",
        model: MotorModel::Xl320,
        direction: 1,
    },
];

static V2_STEPPERS: [StepperSpec; 3] = [
    StepperSpec {
        motor_id: 1,
        name: "Axis 1",
        gear_ratio: 6.4,
        direction: -1,
    },
    StepperSpec {
        motor_id: 2,
        name: "Axis 2",
        gear_ratio: 9.0,
        direction: -1,
    },
    StepperSpec {
        motor_id: 3,
        name: "Axis 3",
        gear_ratio: 7.0,
        direction: 1,
    },
];

static V2_SERVOS: [ServoSpec; 3] = [
    ServoSpec {
        id: 2,
        name: "Axis 4",
        model: MotorModel::Xl430,
        direction: 1,
    },
    ServoSpec {
        id: 3,
        name: "Axis 5",
        model: MotorModel::Xl430,
        direction: -1,
    },
    ServoSpec {
        id: 6,
        name: "Axis 6",
        model: MotorModel::Xl320,
        direction: 1,
    },
];

static V1_MAPPING: JointMapping = JointMapping {
    version: HardwareVersion::V1,
    slots: [can(0), can(1), can(2), can(3), dxl(0), dxl(1)],
    steppers: &V1_STEPPERS,
    servos: &V1_SERVOS,
    can_fallback: &[0.0, 0.628, -1.4, 0.0],
    dxl_fallback: &[0.0, 0.0],
};

static V2_MAPPING: JointMapping = JointMapping {
    version: HardwareVersion::V2,
    slots: [can(0), can(1), can(2), dxl(0), dxl(1), dxl(2)],
    steppers: &V2_STEPPERS,
    servos: &V2_SERVOS,
    can_fallback: &[0.0, 0.628, -1.4],
    dxl_fallback: &[0.0, 0.0, 0.0],
};

/// 查表
pub fn resolve(version: HardwareVersion) -> &'static JointMapping {
    match version {
        HardwareVersion::V1 => &V1_MAPPING,
        HardwareVersion::V2 => &V2_MAPPING,
    }
}

/// 所有已知版本
pub const KNOWN_VERSIONS: [HardwareVersion; 2] = [HardwareVersion::V1, HardwareVersion::V2];

impl JointMapping {
    /// 总线上的关节数
    pub fn joint_count(&self, bus: BusKind) -> usize {
        match bus {
            BusKind::Can => self.steppers.len(),
            BusKind::Dxl => self.servos.len(),
        }
    }

    /// 总线禁用时的替代位置
    pub fn fallback(&self, bus: BusKind) -> &'static [f64] {
        match bus {
            BusKind::Can => self.can_fallback,
            BusKind::Dxl => self.dxl_fallback,
        }
    }

    /// LED 数量：每个腕部执行器一个
    pub fn led_count(&self) -> usize {
        self.servos.len()
    }

    /// 把 6 维位姿拆成 (CAN 子位姿, DXL 子位姿)
    pub fn split(&self, pose: &JointPose) -> (SubPose, SubPose) {
        let mut can_part = SubPose::from_elem(0.0, self.steppers.len());
        let mut dxl_part = SubPose::from_elem(0.0, self.servos.len());
        for (slot, value) in self.slots.iter().zip(pose) {
            match slot.bus {
                BusKind::Can => can_part[slot.local_index] = *value,
                BusKind::Dxl => dxl_part[slot.local_index] = *value,
            }
        }
        (can_part, dxl_part)
    }

    /// 合并两条总线的位置
    ///
    /// `None` 表示总线禁用，对应槽位使用替代位置；缺失的下标同样回落到替代位置。
    pub fn merge(&self, can_part: Option<&[f64]>, dxl_part: Option<&[f64]>) -> JointPose {
        let mut pose = [0.0; JOINT_COUNT];
        for (value, slot) in pose.iter_mut().zip(&self.slots) {
            let source = match slot.bus {
                BusKind::Can => can_part,
                BusKind::Dxl => dxl_part,
            };
            let fallback = self.fallback(slot.bus)[slot.local_index];
            *value = source
                .and_then(|part| part.get(slot.local_index).copied())
                .unwrap_or(fallback);
        }
        pose
    }

    /// 该版本的执行器签名是否与探测结果一致
    pub fn matches_models(&self, models: &BTreeMap<u8, MotorModel>) -> bool {
        self.servos
            .iter()
            .all(|servo| models.get(&servo.id) == Some(&servo.model))
    }
}

/// 探测时需要询问的所有执行器 ID
pub fn probe_ids() -> Vec<u8> {
    let mut ids: Vec<u8> = KNOWN_VERSIONS
        .iter()
        .flat_map(|v| resolve(*v).servos.iter().map(|s| s.id))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// 根据探测到的执行器型号确定硬件版本
///
/// 恰好一个版本匹配才算成功，没有匹配或多个匹配都是配置错误，不做猜测。
pub fn detect_version(models: &BTreeMap<u8, MotorModel>) -> Result<HardwareVersion, HardwareError> {
    let matching: Vec<HardwareVersion> = KNOWN_VERSIONS
        .iter()
        .copied()
        .filter(|v| resolve(*v).matches_models(models))
        .collect();

    match matching.as_slice() {
        [version] => Ok(*version),
        [] => Err(HardwareError::Configuration(format!(
            "detected Dynamixel motors {} match no known hardware version",
            describe_models(models)
        ))),
        _ => Err(HardwareError::Configuration(format!(
            "detected Dynamixel motors {} match several hardware versions",
            describe_models(models)
        ))),
    }
}

fn describe_models(models: &BTreeMap<u8, MotorModel>) -> String {
    if models.is_empty() {
        return "[none]".to_string();
    }
    let parts: Vec<String> = models
        .iter()
        .map(|(id, model)| format!("{}:{}", id, model.name()))
        .collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_counts() {
        for version in KNOWN_VERSIONS {
            let mapping = resolve(version);
            let (can_part, dxl_part) = mapping.split(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
            assert_eq!(can_part.len() + dxl_part.len(), JOINT_COUNT);
            assert_eq!(can_part.len(), mapping.can_fallback.len());
            assert_eq!(dxl_part.len(), mapping.dxl_fallback.len());
        }
        let (can_part, dxl_part) = resolve(HardwareVersion::V1).split(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(can_part.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(dxl_part.as_slice(), &[5.0, 6.0]);
    }

    #[test]
    fn test_merge_uses_fallback_for_disabled_can() {
        let mapping = resolve(HardwareVersion::V1);
        let pose = mapping.merge(None, Some(&[0.25, -0.5]));
        assert_eq!(pose, [0.0, 0.628, -1.4, 0.0, 0.25, -0.5]);
    }

    #[test]
    fn test_merge_uses_fallback_for_disabled_dxl_v2() {
        let mapping = resolve(HardwareVersion::V2);
        let pose = mapping.merge(Some(&[0.1, 0.2, 0.3]), None);
        assert_eq!(pose, [0.1, 0.2, 0.3, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_merge_short_part_falls_back() {
        let mapping = resolve(HardwareVersion::V2);
        let pose = mapping.merge(Some(&[0.1]), Some(&[]));
        assert_eq!(pose, [0.1, 0.628, -1.4, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_slots_cover_each_local_index_once() {
        for version in KNOWN_VERSIONS {
            let mapping = resolve(version);
            for bus in [BusKind::Can, BusKind::Dxl] {
                let mut indices: Vec<usize> = mapping
                    .slots
                    .iter()
                    .filter(|s| s.bus == bus)
                    .map(|s| s.local_index)
                    .collect();
                indices.sort_unstable();
                let expected: Vec<usize> = (0..mapping.joint_count(bus)).collect();
                assert_eq!(indices, expected, "{:?} {:?}", version, bus);
            }
        }
    }

    #[test]
    fn test_detect_v1() {
        let models = BTreeMap::from([(4, MotorModel::Xl320), (5, MotorModel::Xl320)]);
        assert_eq!(detect_version(&models), Ok(HardwareVersion::V1));
    }

    #[test]
    fn test_detect_v2_with_tool_attached() {
        let models = BTreeMap::from([
            (2, MotorModel::Xl430),
            (3, MotorModel::Xl430),
            (6, MotorModel::Xl320),
            (11, MotorModel::Xl320),
        ]);
        assert_eq!(detect_version(&models), Ok(HardwareVersion::V2));
    }

    #[test]
    fn test_detect_no_match_is_configuration_error() {
        let models = BTreeMap::from([(2, MotorModel::Xl320), (6, MotorModel::Xl320)]);
        let err = detect_version(&models).unwrap_err();
        assert!(matches!(err, HardwareError::Configuration(msg) if msg.contains("2:XL-320")));
        assert!(detect_version(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_probe_ids() {
        assert_eq!(probe_ids(), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_stepper_conversion() {
        let spec = V1_STEPPERS[0];
        assert_eq!(spec.rad_to_steps(0.0), 0);
        let steps = spec.rad_to_steps(1.0);
        assert!(steps < 0);
        assert!((spec.steps_to_rad(steps) - 1.0).abs() < 1.0 / spec.steps_per_rad());
    }

    #[test]
    fn test_version_from_int() {
        assert_eq!(HardwareVersion::try_from(2), Ok(HardwareVersion::V2));
        assert!(HardwareVersion::try_from(3).is_err());
    }
}
