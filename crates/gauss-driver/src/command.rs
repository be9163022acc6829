//! 命令类型定义模块
//!
//! - [`GoalMailbox`]: 关节目标的邮箱（覆盖语义），每次写入取代尚未发出的上一条
//! - [`ToolCommand`]: 工具（夹爪/真空泵）命令

use crate::version::SubPose;
use gauss_protocol::MotorModel;
use parking_lot::Mutex;

/// 关节目标邮箱
///
/// 只保留最新一条命令（last-write-wins），由总线轮询线程取走并发送，不排队。
#[derive(Debug, Default)]
pub struct GoalMailbox {
    slot: Mutex<Option<SubPose>>,
}

impl GoalMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入目标，返回被覆盖的旧目标
    pub fn put(&self, goal: SubPose) -> Option<SubPose> {
        self.slot.lock().replace(goal)
    }

    /// 取出目标（邮箱变空）
    pub fn take(&self) -> Option<SubPose> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// 工具命令
///
/// 位置/速度/力矩都是执行器控制表中的原始值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCommand {
    OpenGripper {
        position: u16,
        speed: u16,
        hold_torque: u16,
    },
    /// 以 `max_torque` 闭合，到位后切换为 `hold_torque`
    CloseGripper {
        position: u16,
        speed: u16,
        hold_torque: u16,
        max_torque: u16,
    },
    /// 吸气并保持
    PullVacuum { position: u16, hold_torque: u16 },
    /// 排气，到位后释放力矩
    PushVacuum { position: u16 },
}

/// 命令到位后需要追加执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleAction {
    /// 切换到保持力矩
    HoldTorque(u16),
    /// 释放力矩
    Release,
}

/// 速度寄存器上限（XL-320 Moving Speed / XL-430 Profile Velocity 取同一范围）
pub const MAX_TOOL_SPEED: u16 = 1023;

/// 力矩寄存器上限
pub fn max_torque(model: MotorModel) -> u16 {
    match model {
        MotorModel::Xl320 => 1023,
        // XL-430 使用 Goal PWM
        MotorModel::Xl430 => 885,
    }
}

impl ToolCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCommand::OpenGripper { .. } => "open gripper",
            ToolCommand::CloseGripper { .. } => "close gripper",
            ToolCommand::PullVacuum { .. } => "pull air",
            ToolCommand::PushVacuum { .. } => "push air",
        }
    }

    pub fn position(&self) -> u16 {
        match *self {
            ToolCommand::OpenGripper { position, .. }
            | ToolCommand::CloseGripper { position, .. }
            | ToolCommand::PullVacuum { position, .. }
            | ToolCommand::PushVacuum { position } => position,
        }
    }

    /// 移动过程中的速度（`None` 表示不修改）
    pub fn speed(&self) -> Option<u16> {
        match *self {
            ToolCommand::OpenGripper { speed, .. } | ToolCommand::CloseGripper { speed, .. } => {
                Some(speed)
            },
            _ => None,
        }
    }

    /// 移动过程中的力矩上限
    pub fn moving_torque(&self, model: MotorModel) -> u16 {
        match *self {
            ToolCommand::OpenGripper { hold_torque, .. } => hold_torque,
            ToolCommand::CloseGripper { max_torque, .. } => max_torque,
            ToolCommand::PullVacuum { .. } | ToolCommand::PushVacuum { .. } => max_torque(model),
        }
    }

    /// 到位后的动作
    pub fn settle_action(&self) -> Option<SettleAction> {
        match *self {
            ToolCommand::OpenGripper { .. } => None,
            ToolCommand::CloseGripper { hold_torque, .. }
            | ToolCommand::PullVacuum { hold_torque, .. } => Some(SettleAction::HoldTorque(hold_torque)),
            ToolCommand::PushVacuum { .. } => Some(SettleAction::Release),
        }
    }

    /// 参数范围检查
    pub fn validate(&self, model: MotorModel) -> Result<(), String> {
        if self.position() as u32 > model.max_position() {
            return Err(format!(
                "position {} out of range 0..={} for {}",
                self.position(),
                model.max_position(),
                model.name()
            ));
        }
        if let Some(speed) = self.speed()
            && speed > MAX_TOOL_SPEED
        {
            return Err(format!("speed {} out of range 0..={}", speed, MAX_TOOL_SPEED));
        }

        let limit = max_torque(model);
        let torques = match *self {
            ToolCommand::OpenGripper { hold_torque, .. } => [hold_torque, 0],
            ToolCommand::CloseGripper {
                hold_torque,
                max_torque,
                ..
            } => [hold_torque, max_torque],
            ToolCommand::PullVacuum { hold_torque, .. } => [hold_torque, 0],
            ToolCommand::PushVacuum { .. } => [0, 0],
        };
        if let Some(torque) = torques.iter().find(|t| **t > limit) {
            return Err(format!("torque {} out of range 0..={}", torque, limit));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_mailbox_last_write_wins() {
        let mailbox = GoalMailbox::new();
        assert!(mailbox.put(smallvec![1.0, 2.0]).is_none());
        let replaced = mailbox.put(smallvec![3.0, 4.0]);
        assert_eq!(replaced.as_deref(), Some(&[1.0, 2.0][..]));
        assert_eq!(mailbox.take().as_deref(), Some(&[3.0, 4.0][..]));
        assert!(mailbox.is_empty());
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn test_validate_rejects_out_of_range_position() {
        let cmd = ToolCommand::OpenGripper {
            position: 1024,
            speed: 300,
            hold_torque: 128,
        };
        let err = cmd.validate(MotorModel::Xl320).unwrap_err();
        assert!(err.contains("position 1024"));
        assert!(cmd.validate(MotorModel::Xl430).is_ok());
    }

    #[test]
    fn test_validate_close_gripper_torques() {
        let cmd = ToolCommand::CloseGripper {
            position: 400,
            speed: 300,
            hold_torque: 128,
            max_torque: 2000,
        };
        assert!(cmd.validate(MotorModel::Xl320).unwrap_err().contains("torque 2000"));
    }

    #[test]
    fn test_settle_actions() {
        assert_eq!(
            ToolCommand::PullVacuum {
                position: 600,
                hold_torque: 100
            }
            .settle_action(),
            Some(SettleAction::HoldTorque(100))
        );
        assert_eq!(
            ToolCommand::PushVacuum { position: 200 }.settle_action(),
            Some(SettleAction::Release)
        );
        assert_eq!(
            ToolCommand::OpenGripper {
                position: 600,
                speed: 100,
                hold_torque: 100
            }
            .settle_action(),
            None
        );
    }
}
