//! Dynamixel 菊花链仿真

use crate::{BusError, SerialAdapter};
use gauss_protocol::dxl::{BROADCAST_ID, decode_le, encode_le};
use gauss_protocol::{Instruction, InstructionPacket, MotorModel, StatusPacket};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const MEMORY_SIZE: usize = 256;

// 状态包错误号
const ERR_DATA_RANGE: u8 = 0x04;
const ERR_INSTRUCTION: u8 = 0x02;

struct SimServo {
    model: MotorModel,
    memory: [u8; MEMORY_SIZE],
    online: bool,
    staged: Option<(u16, Vec<u8>)>,
}

impl SimServo {
    fn new(model: MotorModel) -> Self {
        let mut servo = Self {
            model,
            memory: [0u8; MEMORY_SIZE],
            online: true,
            staged: None,
        };
        let table = model.table();
        servo.store(table.model_number, model.model_number() as u32);
        servo.store(
            table.firmware_version,
            match model {
                MotorModel::Xl320 => 29,
                MotorModel::Xl430 => 45,
            },
        );
        servo.store(table.goal_position, model.center_position());
        servo.store(table.present_position, model.center_position());
        servo.store(
            table.present_voltage,
            match model {
                MotorModel::Xl320 => 74,
                MotorModel::Xl430 => 120,
            },
        );
        servo.store(table.present_temperature, 32);
        if model == MotorModel::Xl320 {
            servo.store(table.torque_limit, 1023);
        }
        servo
    }

    fn store(&mut self, (address, len): (u16, u16), value: u32) {
        let _ = self.write(address, &encode_le(value, len as usize));
    }

    fn load(&self, (address, len): (u16, u16)) -> u32 {
        self.read(address, len).map(|bytes| decode_le(&bytes)).unwrap_or(0)
    }

    fn read(&self, address: u16, len: u16) -> Option<Vec<u8>> {
        let start = address as usize;
        let end = start + len as usize;
        (end <= MEMORY_SIZE).then(|| self.memory[start..end].to_vec())
    }

    /// 写寄存器；写目标位置时电机瞬间到位
    fn write(&mut self, address: u16, data: &[u8]) -> bool {
        let start = address as usize;
        let end = start + data.len();
        if end > MEMORY_SIZE {
            return false;
        }
        self.memory[start..end].copy_from_slice(data);

        let table = self.model.table();
        if address == table.goal_position.0 {
            let goal = self.load(table.goal_position);
            self.store(table.present_position, goal);
        }
        true
    }
}

#[derive(Default)]
struct ChainState {
    servos: BTreeMap<u8, SimServo>,
    rx: VecDeque<u8>,
    log: Vec<InstructionPacket>,
    corrupt_replies: bool,
    disconnected: bool,
}

impl ChainState {
    fn reply(&mut self, id: u8, error: u8, params: Vec<u8>) {
        let hardware_alert = self
            .servos
            .get(&id)
            .map(|servo| servo.load(servo.model.table().hardware_error) != 0)
            .unwrap_or(false);
        let error = if hardware_alert { error | 0x80 } else { error };

        let mut bytes = StatusPacket::new(id, error, params).encode();
        if self.corrupt_replies
            && let Some(last) = bytes.last_mut()
        {
            *last ^= 0xFF;
        }
        self.rx.extend(bytes);
    }

    fn handle(&mut self, packet: InstructionPacket) {
        let id = packet.id;
        match packet.instruction {
            Instruction::SyncWrite => self.handle_sync_write(&packet.params),
            Instruction::Action if id == BROADCAST_ID => {
                for servo in self.servos.values_mut().filter(|s| s.online) {
                    if let Some((address, data)) = servo.staged.take() {
                        servo.write(address, &data);
                    }
                }
            },
            _ => {
                let Some(servo) = self.servos.get_mut(&id).filter(|s| s.online) else {
                    // 离线或不存在的电机不应答
                    return;
                };
                let (error, params) = match packet.instruction {
                    Instruction::Ping => {
                        let table = servo.model.table();
                        let mut params = encode_le(servo.model.model_number() as u32, 2);
                        params.push(servo.load(table.firmware_version) as u8);
                        (0, params)
                    },
                    Instruction::Read if packet.params.len() >= 4 => {
                        let address = u16::from_le_bytes([packet.params[0], packet.params[1]]);
                        let len = u16::from_le_bytes([packet.params[2], packet.params[3]]);
                        match servo.read(address, len) {
                            Some(data) => (0, data),
                            None => (ERR_DATA_RANGE, Vec::new()),
                        }
                    },
                    Instruction::Write if packet.params.len() >= 2 => {
                        let address = u16::from_le_bytes([packet.params[0], packet.params[1]]);
                        if servo.write(address, &packet.params[2..]) {
                            (0, Vec::new())
                        } else {
                            (ERR_DATA_RANGE, Vec::new())
                        }
                    },
                    Instruction::RegWrite if packet.params.len() >= 2 => {
                        let address = u16::from_le_bytes([packet.params[0], packet.params[1]]);
                        servo.staged = Some((address, packet.params[2..].to_vec()));
                        (0, Vec::new())
                    },
                    Instruction::Action => {
                        if let Some((address, data)) = servo.staged.take() {
                            servo.write(address, &data);
                        }
                        (0, Vec::new())
                    },
                    _ => (ERR_INSTRUCTION, Vec::new()),
                };
                self.reply(id, error, params);
            },
        }
    }

    fn handle_sync_write(&mut self, params: &[u8]) {
        if params.len() < 4 {
            return;
        }
        let address = u16::from_le_bytes([params[0], params[1]]);
        let data_len = u16::from_le_bytes([params[2], params[3]]) as usize;
        for entry in params[4..].chunks(data_len + 1) {
            if entry.len() != data_len + 1 {
                break;
            }
            if let Some(servo) = self.servos.get_mut(&entry[0]).filter(|s| s.online) {
                servo.write(address, &entry[1..]);
            }
        }
    }
}

/// 仿真 Dynamixel 菊花链
///
/// 应答 PING / READ / WRITE / REG_WRITE / ACTION / SYNC_WRITE，目标位置写入后
/// 当前位置立即等于目标位置。
#[derive(Clone, Default)]
pub struct SimulatedServoChain {
    state: Arc<Mutex<ChainState>>,
}

impl SimulatedServoChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servo(self, id: u8, model: MotorModel) -> Self {
        self.add_servo(id, model);
        self
    }

    pub fn add_servo(&self, id: u8, model: MotorModel) {
        self.state.lock().servos.insert(id, SimServo::new(model));
    }

    /// 模拟单个电机掉线 / 恢复
    pub fn set_online(&self, id: u8, online: bool) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.online = online;
        }
    }

    pub fn is_online(&self, id: u8) -> bool {
        self.state
            .lock()
            .servos
            .get(&id)
            .map(|s| s.online)
            .unwrap_or(false)
    }

    /// 模拟串口拔出：写入返回 IO 错误
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    /// 应答包 CRC 损坏
    pub fn set_corrupt_replies(&self, corrupt: bool) {
        self.state.lock().corrupt_replies = corrupt;
    }

    /// 读取寄存器（`(address, len)` 取自控制表）
    pub fn register(&self, id: u8, entry: (u16, u16)) -> Option<u32> {
        self.state.lock().servos.get(&id).map(|s| s.load(entry))
    }

    pub fn set_register(&self, id: u8, entry: (u16, u16), value: u32) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.store(entry, value);
        }
    }

    pub fn model(&self, id: u8) -> Option<MotorModel> {
        self.state.lock().servos.get(&id).map(|s| s.model)
    }

    pub fn present_ticks(&self, id: u8) -> Option<u32> {
        let model = self.model(id)?;
        self.register(id, model.table().present_position)
    }

    pub fn goal_ticks(&self, id: u8) -> Option<u32> {
        let model = self.model(id)?;
        self.register(id, model.table().goal_position)
    }

    pub fn led(&self, id: u8) -> Option<u32> {
        let model = self.model(id)?;
        self.register(id, model.table().led)
    }

    pub fn torque_enabled(&self, id: u8) -> Option<bool> {
        let model = self.model(id)?;
        self.register(id, model.table().torque_enable).map(|v| v != 0)
    }

    /// 是否有等待 ACTION 的 REG_WRITE
    pub fn has_staged(&self, id: u8) -> bool {
        self.state
            .lock()
            .servos
            .get(&id)
            .map(|s| s.staged.is_some())
            .unwrap_or(false)
    }

    /// 收到的全部指令码（按顺序）
    pub fn instruction_log(&self) -> Vec<Instruction> {
        self.state.lock().log.iter().map(|p| p.instruction).collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl SerialAdapter for SimulatedServoChain {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated serial port unplugged",
            )));
        }
        match InstructionPacket::decode(bytes) {
            Ok(packet) => {
                trace!("SimulatedServoChain <- {:?} id={}", packet.instruction, packet.id);
                state.log.push(packet.clone());
                state.handle(packet);
            },
            Err(e) => trace!("SimulatedServoChain dropped malformed packet: {}", e),
        }
        Ok(())
    }

    fn read_exact_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.rx.len() < buf.len() {
            state.rx.clear();
            return Err(BusError::Timeout);
        }
        for byte in buf.iter_mut() {
            *byte = state.rx.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), BusError> {
        self.state.lock().rx.clear();
        Ok(())
    }
}
