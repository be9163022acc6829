//! 位姿映射属性测试
//!
//! 对任意位姿和任意总线启用组合：
//! - 合并结果总是 6 维
//! - 禁用总线的槽位恰好等于替代位置
//! - 拆分后再合并得到原位姿

use gauss_driver::{BusKind, HardwareVersion, resolve};
use proptest::prelude::*;

fn any_version() -> impl Strategy<Value = HardwareVersion> {
    prop_oneof![Just(HardwareVersion::V1), Just(HardwareVersion::V2)]
}

fn any_pose() -> impl Strategy<Value = [f64; 6]> {
    prop::array::uniform6(-3.0f64..3.0)
}

proptest! {
    #[test]
    fn split_then_merge_is_identity(version in any_version(), pose in any_pose()) {
        let mapping = resolve(version);
        let (can, dxl) = mapping.split(&pose);
        prop_assert_eq!(can.len(), mapping.joint_count(BusKind::Can));
        prop_assert_eq!(dxl.len(), mapping.joint_count(BusKind::Dxl));
        prop_assert_eq!(mapping.merge(Some(&can[..]), Some(&dxl[..])), pose);
    }

    #[test]
    fn disabled_bus_slots_use_fallback(
        version in any_version(),
        pose in any_pose(),
        can_enabled in any::<bool>(),
        dxl_enabled in any::<bool>(),
    ) {
        let mapping = resolve(version);
        let (can, dxl) = mapping.split(&pose);
        let merged = mapping.merge(
            can_enabled.then_some(&can[..]),
            dxl_enabled.then_some(&dxl[..]),
        );
        prop_assert_eq!(merged.len(), 6);

        for (i, slot) in mapping.slots.iter().enumerate() {
            let enabled = match slot.bus {
                BusKind::Can => can_enabled,
                BusKind::Dxl => dxl_enabled,
            };
            if enabled {
                prop_assert_eq!(merged[i], pose[i]);
            } else {
                prop_assert_eq!(merged[i], mapping.fallback(slot.bus)[slot.local_index]);
            }
        }
    }

    #[test]
    fn short_bus_reading_falls_back(version in any_version(), pose in any_pose(), keep in 0usize..3) {
        let mapping = resolve(version);
        let (can, _) = mapping.split(&pose);
        let truncated = &can[..keep.min(can.len())];
        let merged = mapping.merge(Some(truncated), None);
        for (i, slot) in mapping.slots.iter().enumerate() {
            if slot.bus == BusKind::Can && slot.local_index >= truncated.len() {
                prop_assert_eq!(merged[i], mapping.can_fallback[slot.local_index]);
            }
        }
    }
}
