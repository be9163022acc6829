//! 指令包 / 状态包编解码

use super::{BROADCAST_ID, Instruction};
use crate::ProtocolError;
use crc::{CRC_16_UMTS, Crc};

/// 包头
pub const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// 包头 + ID + LEN 的长度，读取时先读这一段再按 LEN 读剩余部分
pub const HEADER_LEN: usize = 7;

// CRC-16/UMTS 即 Dynamixel 使用的 CRC（poly 0x8005, init 0, 不反射）
const DXL_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_UMTS);

/// 计算 CRC
pub fn crc16(bytes: &[u8]) -> u16 {
    DXL_CRC.checksum(bytes)
}

/// 小端编码，`len` 取 1 / 2 / 4
pub fn encode_le(value: u32, len: usize) -> Vec<u8> {
    value.to_le_bytes()[..len.min(4)].to_vec()
}

/// 小端解码（最多 4 字节）
pub fn decode_le(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (*b as u32) << (8 * i))
}

/// 根据前 7 个字节得到剩余需要读取的字节数
pub fn remaining_len(prefix: &[u8]) -> Result<usize, ProtocolError> {
    if prefix.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidLength {
            expected: HEADER_LEN,
            actual: prefix.len(),
        });
    }
    if prefix[..4] != HEADER {
        return Err(ProtocolError::InvalidHeader);
    }
    Ok(u16::from_le_bytes([prefix[5], prefix[6]]) as usize)
}

fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    for &byte in body {
        out.push(byte);
        if out.len() >= 3 && out[out.len() - 3..] == [0xFF, 0xFF, 0xFD] {
            out.push(0xFD);
        }
    }
    out
}

fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        out.push(body[i]);
        if out.len() >= 3
            && out[out.len() - 3..] == [0xFF, 0xFF, 0xFD]
            && body.get(i + 1) == Some(&0xFD)
        {
            i += 1;
        }
        i += 1;
    }
    out
}

fn encode_packet(id: u8, body: &[u8]) -> Vec<u8> {
    let stuffed = stuff(body);
    let len = (stuffed.len() + 2) as u16;

    let mut packet = Vec::with_capacity(HEADER_LEN + stuffed.len() + 2);
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(&stuffed);
    let crc = crc16(&packet);
    packet.extend_from_slice(&crc.to_le_bytes());
    packet
}

/// 校验整包并返回 (id, 去填充后的 INST + PARAM)
fn decode_packet(bytes: &[u8]) -> Result<(u8, Vec<u8>), ProtocolError> {
    let len = remaining_len(bytes)?;
    if len < 3 {
        return Err(ProtocolError::InvalidLength {
            expected: 3,
            actual: len,
        });
    }
    let total = HEADER_LEN + len;
    if bytes.len() < total {
        return Err(ProtocolError::InvalidLength {
            expected: total,
            actual: bytes.len(),
        });
    }

    let expected = crc16(&bytes[..total - 2]);
    let actual = u16::from_le_bytes([bytes[total - 2], bytes[total - 1]]);
    if expected != actual {
        return Err(ProtocolError::CrcMismatch { expected, actual });
    }

    Ok((bytes[4], unstuff(&bytes[HEADER_LEN..total - 2])))
}

/// 指令包（主机 → 电机）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPacket {
    pub id: u8,
    pub instruction: Instruction,
    pub params: Vec<u8>,
}

impl InstructionPacket {
    pub fn ping(id: u8) -> Self {
        Self {
            id,
            instruction: Instruction::Ping,
            params: Vec::new(),
        }
    }

    pub fn read(id: u8, address: u16, len: u16) -> Self {
        let mut params = address.to_le_bytes().to_vec();
        params.extend_from_slice(&len.to_le_bytes());
        Self {
            id,
            instruction: Instruction::Read,
            params,
        }
    }

    pub fn write(id: u8, address: u16, data: &[u8]) -> Self {
        Self::addressed(id, Instruction::Write, address, data)
    }

    pub fn reg_write(id: u8, address: u16, data: &[u8]) -> Self {
        Self::addressed(id, Instruction::RegWrite, address, data)
    }

    /// 广播 ACTION：执行所有已暂存的 REG_WRITE
    pub fn action() -> Self {
        Self {
            id: BROADCAST_ID,
            instruction: Instruction::Action,
            params: Vec::new(),
        }
    }

    /// 同步写：同一地址、同一长度，一包写多个电机
    ///
    /// `entries` 中每项数据长度必须等于 `data_len`。
    pub fn sync_write(address: u16, data_len: u16, entries: &[(u8, Vec<u8>)]) -> Self {
        let mut params = address.to_le_bytes().to_vec();
        params.extend_from_slice(&data_len.to_le_bytes());
        for (id, data) in entries {
            params.push(*id);
            params.extend_from_slice(data);
        }
        Self {
            id: BROADCAST_ID,
            instruction: Instruction::SyncWrite,
            params,
        }
    }

    fn addressed(id: u8, instruction: Instruction, address: u16, data: &[u8]) -> Self {
        let mut params = address.to_le_bytes().to_vec();
        params.extend_from_slice(data);
        Self {
            id,
            instruction,
            params,
        }
    }

    /// 广播包不返回状态包
    pub fn expects_status(&self) -> bool {
        self.id != BROADCAST_ID
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + self.params.len());
        body.push(self.instruction.into());
        body.extend_from_slice(&self.params);
        encode_packet(self.id, &body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (id, body) = decode_packet(bytes)?;
        let instruction = Instruction::try_from(body[0]).map_err(|e| ProtocolError::InvalidValue {
            field: "Instruction".to_string(),
            value: e.number as u32,
        })?;
        Ok(Self {
            id,
            instruction,
            params: body[1..].to_vec(),
        })
    }
}

/// 状态包（电机 → 主机）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    /// Bit 7: 硬件告警；Bit 0-6: 错误号
    pub error: u8,
    pub params: Vec<u8>,
}

impl StatusPacket {
    pub fn new(id: u8, error: u8, params: Vec<u8>) -> Self {
        Self { id, error, params }
    }

    /// 电机存在硬件错误，需要读取 Hardware Error Status
    pub fn hardware_alert(&self) -> bool {
        self.error & 0x80 != 0
    }

    /// 指令错误号（0 表示成功）
    pub fn error_number(&self) -> u8 {
        self.error & 0x7F
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + self.params.len());
        body.push(Instruction::Status.into());
        body.push(self.error);
        body.extend_from_slice(&self.params);
        encode_packet(self.id, &body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (id, body) = decode_packet(bytes)?;
        if body[0] != u8::from(Instruction::Status) {
            return Err(ProtocolError::InvalidValue {
                field: "Instruction".to_string(),
                value: body[0] as u32,
            });
        }
        let error = *body.get(1).ok_or(ProtocolError::InvalidLength {
            expected: 2,
            actual: body.len(),
        })?;
        Ok(Self {
            id,
            error,
            params: body[2..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_matches_reference_bytes() {
        // 协议手册中 ID 1 的 PING 示例
        assert_eq!(
            InstructionPacket::ping(1).encode(),
            vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]
        );
    }

    #[test]
    fn test_read_matches_reference_bytes() {
        // READ ID 1, 地址 132, 长度 4
        assert_eq!(
            InstructionPacket::read(1, 132, 4).encode(),
            vec![
                0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x02, 0x84, 0x00, 0x04, 0x00, 0x1D,
                0x15
            ]
        );
    }

    #[test]
    fn test_byte_stuffing_in_params() {
        let packet = InstructionPacket::write(1, 0x0010, &[0xFF, 0xFF, 0xFD, 0x01]);
        let encoded = packet.encode();
        // LEN = INST(1) + addr(2) + data(4) + stuffing(1) + CRC(2)
        assert_eq!(u16::from_le_bytes([encoded[5], encoded[6]]), 10);
        assert_eq!(&encoded[10..15], &[0xFF, 0xFF, 0xFD, 0xFD, 0x01]);
        assert_eq!(InstructionPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_status_decode_detects_crc_error() {
        let mut bytes = StatusPacket::new(3, 0, vec![0x5E, 0x01]).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            StatusPacket::decode(&bytes),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_status_alert_bit() {
        let status = StatusPacket::new(2, 0x80, vec![]);
        assert!(status.hardware_alert());
        assert_eq!(status.error_number(), 0);
    }

    #[test]
    fn test_remaining_len_rejects_bad_header() {
        assert_eq!(
            remaining_len(&[0xFF, 0x00, 0xFD, 0x00, 1, 3, 0]),
            Err(ProtocolError::InvalidHeader)
        );
    }

    #[test]
    fn test_sync_write_layout() {
        let packet = InstructionPacket::sync_write(116, 4, &[(2, encode_le(2048, 4)), (3, encode_le(1, 4))]);
        assert_eq!(packet.id, BROADCAST_ID);
        assert!(!packet.expects_status());
        assert_eq!(
            packet.params,
            vec![116, 0, 4, 0, 2, 0x00, 0x08, 0, 0, 3, 1, 0, 0, 0]
        );
    }

    #[test]
    fn test_le_helpers() {
        assert_eq!(decode_le(&[0x00, 0x08]), 2048);
        assert_eq!(encode_le(0x1234_5678, 2), vec![0x78, 0x56]);
    }
}
