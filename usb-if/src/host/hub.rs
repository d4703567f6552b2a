//! USB Hub 类请求与数据结构
//!
//! 参照 USB 2.0 规范第 11.24 章。Root Hub 驱动与外部 Hub 驱动共用这些定义。

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Hub 描述符类型
pub const HUB_DESCRIPTOR_TYPE: u8 = 0x29;

/// Hub 类请求
///
/// 参照 USB 2.0 规范表 11-15，取值为 `bmRequestType << 8 | bRequest`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum HubRequest {
    GetHubStatus = 0xa000,
    GetHubDescriptor = 0xa006,
    ClearHubFeature = 0x2001,
    SetHubFeature = 0x2003,
    GetPortStatus = 0xa300,
    ClearPortFeature = 0x2301,
    SetPortFeature = 0x2303,
}

/// Hub 特性选择子
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

/// 端口特性选择子
///
/// 参照 USB 2.0 规范表 11-17。
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
}

bitflags! {
    /// wPortStatus（表 11-21）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatusBits: u16 {
        const CONNECTION = 0x0001;
        const ENABLE = 0x0002;
        const SUSPEND = 0x0004;
        const OVER_CURRENT = 0x0008;
        const RESET = 0x0010;
        const POWER = 0x0100;
        const LOW_SPEED = 0x0200;
        const HIGH_SPEED = 0x0400;
        const TEST = 0x0800;
        const INDICATOR = 0x1000;
    }

    /// wPortChange（表 11-22）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChangeBits: u16 {
        const C_CONNECTION = 0x0001;
        const C_ENABLE = 0x0002;
        const C_SUSPEND = 0x0004;
        const C_OVER_CURRENT = 0x0008;
        const C_RESET = 0x0010;
    }
}

/// GetPortStatus 的回复：wPortStatus + wPortChange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatusWord {
    pub status: PortStatusBits,
    pub change: PortChangeBits,
}

impl PortStatusWord {
    /// 线上格式（小端，4 字节）
    pub fn to_le_bytes(&self) -> [u8; 4] {
        let raw = (self.status.bits() as u32) | ((self.change.bits() as u32) << 16);
        raw.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        let raw = u32::from_le_bytes(bytes);
        Self {
            status: PortStatusBits::from_bits_retain(raw as u16),
            change: PortChangeBits::from_bits_retain((raw >> 16) as u16),
        }
    }

    /// 展开为便于上层使用的结构
    pub fn decode(&self) -> PortStatus {
        let s = self.status;
        PortStatus {
            connected: s.contains(PortStatusBits::CONNECTION),
            enabled: s.contains(PortStatusBits::ENABLE),
            suspended: s.contains(PortStatusBits::SUSPEND),
            over_current: s.contains(PortStatusBits::OVER_CURRENT),
            resetting: s.contains(PortStatusBits::RESET),
            powered: s.contains(PortStatusBits::POWER),
            low_speed: s.contains(PortStatusBits::LOW_SPEED),
            high_speed: s.contains(PortStatusBits::HIGH_SPEED),
            speed: DeviceSpeed::from_usb2_hub_status(s.bits()),
            change: PortStatusChange::from(self.change),
        }
    }
}

// ============================================================================
// 共享数据结构
// ============================================================================

/// Hub 描述符
///
/// 参照 USB 2.0 规范 11.23.2.1。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor {
    /// 端口数量
    pub num_ports: u8,

    /// Hub 特性
    pub characteristics: HubCharacteristics,

    /// 电源开通到电源良好的时间（单位：2ms）
    pub power_good_time: u8,

    /// Hub 控制器电流（单位：mA）
    pub hub_current: u8,

    /// 不可移除设备位图，bit N 对应端口 N（bit 0 保留）
    pub device_removable: u16,
}

impl HubDescriptor {
    /// 每个位图占用的字节数
    fn bitmap_len(&self) -> usize {
        1 + self.num_ports as usize / 8
    }

    /// bDescLength
    pub fn len(&self) -> usize {
        7 + 2 * self.bitmap_len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_ports == 0
    }

    /// 序列化为 USB 2.0 Hub 描述符，返回写入的字节数。
    ///
    /// 第二个位图是 USB 1.0 遗留的 PortPwrCtrlMask，按规范全部置 1。
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        let len = self.len();
        let bitmap_len = self.bitmap_len();
        let mut raw = [0u8; 7 + 2 * 32];

        raw[0] = len as u8;
        raw[1] = HUB_DESCRIPTOR_TYPE;
        raw[2] = self.num_ports;
        raw[3..5].copy_from_slice(&self.characteristics.to_descriptor().to_le_bytes());
        raw[5] = self.power_good_time;
        raw[6] = self.hub_current;

        let removable = self.device_removable.to_le_bytes();
        for i in 0..bitmap_len {
            raw[7 + i] = removable.get(i).copied().unwrap_or(0);
            raw[7 + bitmap_len + i] = 0xff;
        }

        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&raw[..n]);
        n
    }
}

/// Hub 特性
///
/// 参照 USB 2.0 规范表 11-13（wHubCharacteristics）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubCharacteristics {
    /// 电源切换模式
    pub power_switching: PowerSwitchingMode,

    /// 复合设备
    pub compound_device: bool,

    /// 过流保护模式
    pub over_current_mode: OverCurrentMode,

    /// 端口指示灯支持
    pub port_indicators: bool,
}

/// 电源切换模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSwitchingMode {
    /// 所有端口同时供电
    Ganged,

    /// 每个端口独立控制
    Individual,

    /// 无电源控制（总是供电）
    AlwaysPower,
}

/// 过流保护模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverCurrentMode {
    /// 全局过流保护
    Global,

    /// 每个端口独立保护
    Individual,

    /// 无过流保护
    None,
}

/// 端口状态
///
/// 参照 USB 2.0 规范表 11-21。
#[derive(Debug, Clone, Copy)]
pub struct PortStatus {
    /// 当前连接状态
    pub connected: bool,

    /// 端口已启用
    pub enabled: bool,

    /// 已挂起
    pub suspended: bool,

    /// 过流检测
    pub over_current: bool,

    /// 复位中
    pub resetting: bool,

    /// 电源已开启
    pub powered: bool,

    /// 低速设备连接
    pub low_speed: bool,

    /// 高速设备连接
    pub high_speed: bool,

    /// 端口速度
    pub speed: DeviceSpeed,

    /// 端口状态变化标志
    pub change: PortStatusChange,
}

/// 端口状态变化标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatusChange {
    /// 连接状态变化
    pub connection_changed: bool,

    /// 启用状态变化
    pub enabled_changed: bool,

    /// 复位完成
    pub reset_complete: bool,

    /// 挂起状态变化
    pub suspend_changed: bool,

    /// 过流状态变化
    pub over_current_changed: bool,
}

impl From<PortChangeBits> for PortStatusChange {
    fn from(c: PortChangeBits) -> Self {
        Self {
            connection_changed: c.contains(PortChangeBits::C_CONNECTION),
            enabled_changed: c.contains(PortChangeBits::C_ENABLE),
            reset_complete: c.contains(PortChangeBits::C_RESET),
            suspend_changed: c.contains(PortChangeBits::C_SUSPEND),
            over_current_changed: c.contains(PortChangeBits::C_OVER_CURRENT),
        }
    }
}

impl PortStatusChange {
    pub fn any(&self) -> bool {
        self.connection_changed
            || self.enabled_changed
            || self.reset_complete
            || self.suspend_changed
            || self.over_current_changed
    }
}

/// USB 设备速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceSpeed {
    Low = 0,
    Full = 1,
    High = 2,
    Wireless = 3,
    SuperSpeed = 4,
    SuperSpeedPlus = 5,
}

impl DeviceSpeed {
    /// 从 USB 2.0 wPortStatus 的速度位推断
    pub fn from_usb2_hub_status(raw: u16) -> Self {
        let status = PortStatusBits::from_bits_retain(raw);
        if status.contains(PortStatusBits::LOW_SPEED) {
            DeviceSpeed::Low
        } else if status.contains(PortStatusBits::HIGH_SPEED) {
            DeviceSpeed::High
        } else {
            DeviceSpeed::Full
        }
    }

    /// 对应的 wPortStatus 速度位
    pub fn to_usb2_hub_status(self) -> PortStatusBits {
        match self {
            DeviceSpeed::Low => PortStatusBits::LOW_SPEED,
            DeviceSpeed::High => PortStatusBits::HIGH_SPEED,
            _ => PortStatusBits::empty(),
        }
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

impl HubCharacteristics {
    /// 从描述符原始数据解析
    pub fn from_descriptor(value: u16) -> Self {
        let power_switching = match value & 0x03 {
            0x00 => PowerSwitchingMode::Ganged,
            0x01 => PowerSwitchingMode::Individual,
            _ => PowerSwitchingMode::AlwaysPower,
        };

        let compound_device = (value & 0x04) != 0;
        let over_current_mode = match value & 0x18 {
            0x00 => OverCurrentMode::Global,
            0x08 => OverCurrentMode::Individual,
            _ => OverCurrentMode::None,
        };
        let port_indicators = (value & 0x80) != 0;

        Self {
            power_switching,
            compound_device,
            over_current_mode,
            port_indicators,
        }
    }

    /// 转换为描述符原始数据
    pub fn to_descriptor(&self) -> u16 {
        let mut value = 0u16;

        value |= match self.power_switching {
            PowerSwitchingMode::Ganged => 0x00,
            PowerSwitchingMode::Individual => 0x01,
            PowerSwitchingMode::AlwaysPower => 0x02,
        };

        if self.compound_device {
            value |= 0x04;
        }

        value |= match self.over_current_mode {
            OverCurrentMode::Global => 0x00,
            OverCurrentMode::Individual => 0x08,
            OverCurrentMode::None => 0x10,
        };

        if self.port_indicators {
            value |= 0x80;
        }

        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_characteristics_roundtrip() {
        let original = HubCharacteristics {
            power_switching: PowerSwitchingMode::Individual,
            compound_device: true,
            over_current_mode: OverCurrentMode::Global,
            port_indicators: true,
        };

        let descriptor = original.to_descriptor();
        let decoded = HubCharacteristics::from_descriptor(descriptor);

        assert_eq!(original, decoded);
    }

    #[test]
    fn test_ehci_characteristics_encoding() {
        // 每端口过流上报 + 每端口电源控制
        let c = HubCharacteristics {
            power_switching: PowerSwitchingMode::Individual,
            compound_device: false,
            over_current_mode: OverCurrentMode::Individual,
            port_indicators: false,
        };
        assert_eq!(c.to_descriptor(), 0x0009);

        let c = HubCharacteristics::from_descriptor(0x000a);
        assert_eq!(c.power_switching, PowerSwitchingMode::AlwaysPower);
        assert_eq!(c.over_current_mode, OverCurrentMode::Individual);
    }

    #[test]
    fn test_hub_descriptor_bytes() {
        let desc = HubDescriptor {
            num_ports: 4,
            characteristics: HubCharacteristics::from_descriptor(0x0009),
            power_good_time: 10,
            hub_current: 0,
            device_removable: 0,
        };
        let mut buf = [0u8; 16];
        let n = desc.write_to(&mut buf);

        assert_eq!(n, 9);
        assert_eq!(
            &buf[..n],
            &[9, HUB_DESCRIPTOR_TYPE, 4, 0x09, 0x00, 10, 0, 0x00, 0xff]
        );
    }

    #[test]
    fn test_hub_descriptor_wide() {
        let desc = HubDescriptor {
            num_ports: 9,
            characteristics: HubCharacteristics::from_descriptor(0x000a),
            power_good_time: 10,
            hub_current: 0,
            device_removable: 0,
        };
        let mut buf = [0u8; 16];
        assert_eq!(desc.write_to(&mut buf), 11);
        assert_eq!(&buf[7..11], &[0, 0, 0xff, 0xff]);

        // 缓冲区不足时截断
        let mut short = [0u8; 4];
        assert_eq!(desc.write_to(&mut short), 4);
        assert_eq!(short[0], 11);
    }

    #[test]
    fn test_port_status_word() {
        let word = PortStatusWord {
            status: PortStatusBits::CONNECTION
                | PortStatusBits::ENABLE
                | PortStatusBits::POWER
                | PortStatusBits::HIGH_SPEED,
            change: PortChangeBits::C_RESET,
        };
        let bytes = word.to_le_bytes();
        assert_eq!(bytes, [0x03, 0x05, 0x10, 0x00]);

        let status = PortStatusWord::from_le_bytes(bytes).decode();
        assert!(status.connected && status.enabled && status.powered);
        assert_eq!(status.speed, DeviceSpeed::High);
        assert!(status.change.reset_complete);
        assert!(!status.change.connection_changed);
    }

    #[test]
    fn test_feature_decode() {
        assert_eq!(PortFeature::try_from(4u16), Ok(PortFeature::Reset));
        assert_eq!(PortFeature::try_from(20u16), Ok(PortFeature::CReset));
        assert!(PortFeature::try_from(5u16).is_err());
        assert_eq!(
            HubRequest::try_from(0xa300u16),
            Ok(HubRequest::GetPortStatus)
        );
    }
}
