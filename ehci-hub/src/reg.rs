//! EHCI 寄存器访问层
//!
//! 参照 EHCI 规范 1.0 第 2 章。端口状态机只通过 [`EhciRegisters`] 访问硬件，
//! 所有 PORTSC 写操作都先经过 [`PortSc::for_write`] 屏蔽写 1 清零的变化位。

use core::ptr::NonNull;

use bitflags::bitflags;
use tock_registers::{
    LocalRegisterCopy,
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::{ReadOnly, ReadWrite},
};
use usb_if::host::hub::DeviceSpeed;

use crate::err::{RegError, Result};

/// 最大端口数（HCSPARAMS.N_PORTS 只有 4 位）
pub const MAX_PORTS: usize = 15;

bitflags! {
    /// 端口状态与控制寄存器 PORTSC（EHCI 2.3.9）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortSc: u32 {
        /// 当前连接状态
        const CONNECT = 1 << 0;
        /// 连接状态变化（RWC）
        const CSC = 1 << 1;
        /// 端口使能
        const PE = 1 << 2;
        /// 使能变化（RWC）
        const PEC = 1 << 3;
        /// 过流
        const OC = 1 << 4;
        /// 过流变化（RWC）
        const OCC = 1 << 5;
        /// 强制恢复信号
        const RESUME = 1 << 6;
        const SUSPEND = 1 << 7;
        const RESET = 1 << 8;
        /// 线路状态 D+/D-
        const LINE_STATUS = 0b11 << 10;
        const POWER = 1 << 12;
        /// 端口归属：1 = companion 控制器
        const OWNER = 1 << 13;
        const INDICATOR = 0b11 << 14;
        const TEST = 0b1111 << 16;
        const WKCONN_E = 1 << 20;
        const WKDISC_E = 1 << 21;
        const WKOC_E = 1 << 22;
        /// 集成 TT 控制器（TDI）上报的端口速度
        const SPEED = 0b11 << 26;
    }
}

impl PortSc {
    /// 写 1 清零的变化位
    pub const RWC: Self = Self::CSC.union(Self::PEC).union(Self::OCC);

    /// 远程唤醒使能位
    pub const WAKE: Self = Self::WKCONN_E.union(Self::WKDISC_E).union(Self::WKOC_E);

    pub fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// 读-改-写时的基准值：去掉所有 RWC 位，避免误清未处理的变化。
    #[must_use]
    pub fn for_write(self) -> Self {
        self.difference(Self::RWC)
    }

    /// 线路处于 K 状态，说明连接的是低速设备。
    pub fn is_low_speed_line(self) -> bool {
        self.bits() & Self::LINE_STATUS.bits() == 1 << 10
    }

    /// 根据当前连接状态选择唤醒条件
    pub fn wake_bits_for_connect(self) -> Self {
        if self.contains(Self::CONNECT) {
            Self::WKOC_E | Self::WKDISC_E
        } else {
            Self::WKOC_E | Self::WKCONN_E
        }
    }

    /// PORTSC[19:16] 测试模式选择子
    pub fn test_selector(selector: u8) -> Self {
        Self::from_bits_retain(((selector as u32) & 0xf) << 16)
    }

    /// 集成 TT 控制器的速度字段
    pub fn tdi_speed(self) -> DeviceSpeed {
        match (self.bits() >> 26) & 0b11 {
            0 => DeviceSpeed::Full,
            1 => DeviceSpeed::Low,
            _ => DeviceSpeed::High,
        }
    }
}

bitflags! {
    /// USBCMD（EHCI 2.3.1）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsbCmd: u32 {
        const RUN = 1 << 0;
        const HCRESET = 1 << 1;
        const PSE = 1 << 4;
        const ASE = 1 << 5;
        const IAAD = 1 << 6;
    }

    /// USBSTS / USBINTR（EHCI 2.3.2, 2.3.3）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsbSts: u32 {
        const INT = 1 << 0;
        const ERR = 1 << 1;
        /// 端口变化检测
        const PCD = 1 << 2;
        const FLR = 1 << 3;
        const FATAL = 1 << 4;
        const IAA = 1 << 5;
        const HALT = 1 << 12;
        const RECL = 1 << 13;
        const PSS = 1 << 14;
        const ASS = 1 << 15;
    }
}

impl UsbSts {
    /// 写 1 清零的中断状态位
    pub const W1C: Self = Self::INT
        .union(Self::ERR)
        .union(Self::PCD)
        .union(Self::FLR)
        .union(Self::FATAL)
        .union(Self::IAA);

    /// 运行时打开的中断
    pub const INTR_MASK: Self = Self::IAA
        .union(Self::FATAL)
        .union(Self::PCD)
        .union(Self::ERR)
        .union(Self::INT);
}

register_bitfields![u32,
    /// Capability Register Length and Interface Version
    pub CAPLENGTH_HCIVERSION [
        CAPLENGTH OFFSET(0) NUMBITS(8) [],
        HCIVERSION OFFSET(16) NUMBITS(16) []
    ],

    /// Structural Parameters
    pub HCSPARAMS [
        /// 端口数量
        N_PORTS OFFSET(0) NUMBITS(4) [],
        /// 端口电源开关
        PPC OFFSET(4) NUMBITS(1) [],
        /// 端口路由规则
        PRR OFFSET(7) NUMBITS(1) [],
        N_PCC OFFSET(8) NUMBITS(4) [],
        /// companion 控制器数量
        N_CC OFFSET(12) NUMBITS(4) [],
        P_INDICATOR OFFSET(16) NUMBITS(1) [],
        DEBUG_N OFFSET(20) NUMBITS(4) []
    ]
];

/// 解码后的 HCSPARAMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcsParams {
    pub n_ports: u8,
    /// 端口带电源开关，可单独上下电
    pub ppc: bool,
    pub n_cc: u8,
    pub indicator: bool,
    /// 调试端口号（1-based），0 表示无
    pub debug_port: u8,
}

impl HcsParams {
    pub fn from_raw(raw: u32) -> Self {
        let reg = LocalRegisterCopy::<u32, HCSPARAMS::Register>::new(raw);
        Self {
            n_ports: reg.read(HCSPARAMS::N_PORTS) as u8,
            ppc: reg.is_set(HCSPARAMS::PPC),
            n_cc: reg.read(HCSPARAMS::N_CC) as u8,
            indicator: reg.is_set(HCSPARAMS::P_INDICATOR),
            debug_port: reg.read(HCSPARAMS::DEBUG_N) as u8,
        }
    }
}

/// 寄存器访问接口
///
/// 端口下标均为 0-based。实现方只负责搬运 32 位值，不做任何重试；
/// 访问失败对调用者是致命的。
pub trait EhciRegisters: Send + 'static {
    fn hcs_params(&self) -> Result<HcsParams>;

    fn read_port(&mut self, index: usize) -> Result<PortSc>;
    fn write_port(&mut self, index: usize, value: PortSc) -> Result<()>;

    fn read_command(&mut self) -> Result<UsbCmd>;
    fn write_command(&mut self, value: UsbCmd) -> Result<()>;

    fn read_status(&mut self) -> Result<UsbSts>;
    fn write_status(&mut self, value: UsbSts) -> Result<()>;

    fn read_intr_enable(&mut self) -> Result<UsbSts>;
    fn write_intr_enable(&mut self, value: UsbSts) -> Result<()>;

    /// 硬件当前是否可访问（例如 PCI 设备处于 D0）
    fn accessible(&self) -> bool {
        true
    }

    /// 读-改-写端口寄存器，返回写入的值。
    ///
    /// `f` 收到的是已经屏蔽掉 RWC 位的当前值；需要确认某个变化位时由 `f` 显式置位。
    fn modify_port<F>(&mut self, index: usize, f: F) -> Result<PortSc>
    where
        F: FnOnce(PortSc) -> PortSc,
        Self: Sized,
    {
        let value = f(self.read_port(index)?.for_write());
        self.write_port(index, value)?;
        Ok(value)
    }
}

/// Capability 寄存器组
#[repr(C)]
pub struct EhciCapRegisters {
    pub caplength_hciversion: ReadOnly<u32, CAPLENGTH_HCIVERSION::Register>,
    pub hcsparams: ReadOnly<u32, HCSPARAMS::Register>,
    pub hccparams: ReadOnly<u32>,
}

/// Operational 寄存器组
#[repr(C)]
pub struct EhciOpRegisters {
    /// 0x00
    pub usbcmd: ReadWrite<u32>,
    /// 0x04
    pub usbsts: ReadWrite<u32>,
    /// 0x08
    pub usbintr: ReadWrite<u32>,
    /// 0x0c
    pub frindex: ReadWrite<u32>,
    /// 0x10
    pub ctrldssegment: ReadWrite<u32>,
    /// 0x14
    pub periodiclistbase: ReadWrite<u32>,
    /// 0x18
    pub asynclistaddr: ReadWrite<u32>,
    _reserved: [u32; 9],
    /// 0x40
    pub configflag: ReadWrite<u32>,
    /// 0x44
    pub portsc: [ReadWrite<u32>; MAX_PORTS],
}

/// 内存映射的 EHCI 寄存器
pub struct MmioRegisters {
    cap: NonNull<EhciCapRegisters>,
    op: NonNull<EhciOpRegisters>,
    n_ports: usize,
}

unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// # Safety
    ///
    /// `mmio_base` 必须指向已映射的 EHCI 寄存器窗口，并且在本对象生命周期内有效。
    pub unsafe fn new(mmio_base: NonNull<u8>) -> Self {
        let cap = mmio_base.cast::<EhciCapRegisters>();
        let caplength = unsafe { cap.as_ref() }
            .caplength_hciversion
            .read(CAPLENGTH_HCIVERSION::CAPLENGTH) as usize;
        let op = unsafe { mmio_base.add(caplength) }.cast::<EhciOpRegisters>();
        let n_ports = unsafe { cap.as_ref() }.hcsparams.read(HCSPARAMS::N_PORTS) as usize;
        debug!("EHCI caplength {caplength:#x}, {n_ports} ports");
        Self { cap, op, n_ports }
    }

    fn cap(&self) -> &EhciCapRegisters {
        unsafe { self.cap.as_ref() }
    }

    fn op(&self) -> &EhciOpRegisters {
        unsafe { self.op.as_ref() }
    }

    fn portsc(&self, index: usize) -> Result<&ReadWrite<u32>> {
        if index >= self.n_ports {
            return Err(RegError {
                offset: 0x44 + index * 4,
            }
            .into());
        }
        Ok(&self.op().portsc[index])
    }
}

impl EhciRegisters for MmioRegisters {
    fn hcs_params(&self) -> Result<HcsParams> {
        Ok(HcsParams::from_raw(self.cap().hcsparams.get()))
    }

    fn read_port(&mut self, index: usize) -> Result<PortSc> {
        Ok(PortSc::from_raw(self.portsc(index)?.get()))
    }

    fn write_port(&mut self, index: usize, value: PortSc) -> Result<()> {
        trace!("PORTSC[{}] <- {:#010x}", index + 1, value.bits());
        self.portsc(index)?.set(value.bits());
        Ok(())
    }

    fn read_command(&mut self) -> Result<UsbCmd> {
        Ok(UsbCmd::from_bits_retain(self.op().usbcmd.get()))
    }

    fn write_command(&mut self, value: UsbCmd) -> Result<()> {
        self.op().usbcmd.set(value.bits());
        Ok(())
    }

    fn read_status(&mut self) -> Result<UsbSts> {
        Ok(UsbSts::from_bits_retain(self.op().usbsts.get()))
    }

    fn write_status(&mut self, value: UsbSts) -> Result<()> {
        self.op().usbsts.set(value.bits());
        Ok(())
    }

    fn read_intr_enable(&mut self) -> Result<UsbSts> {
        Ok(UsbSts::from_bits_retain(self.op().usbintr.get()))
    }

    fn write_intr_enable(&mut self, value: UsbSts) -> Result<()> {
        self.op().usbintr.set(value.bits());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_write_masks_change_bits() {
        let v = PortSc::CONNECT | PortSc::CSC | PortSc::PE | PortSc::PEC | PortSc::OCC;
        assert_eq!(v.for_write(), PortSc::CONNECT | PortSc::PE);
    }

    #[test]
    fn test_line_status() {
        assert!(PortSc::from_raw(1 << 10).is_low_speed_line());
        assert!(!PortSc::from_raw(2 << 10).is_low_speed_line());
        assert!(!PortSc::from_raw(3 << 10).is_low_speed_line());
    }

    #[test]
    fn test_wake_bits() {
        assert_eq!(
            PortSc::CONNECT.wake_bits_for_connect(),
            PortSc::WKOC_E | PortSc::WKDISC_E
        );
        assert_eq!(
            PortSc::empty().wake_bits_for_connect(),
            PortSc::WKOC_E | PortSc::WKCONN_E
        );
    }

    #[test]
    fn test_hcs_params() {
        let raw = (HCSPARAMS::N_PORTS.val(6)
            + HCSPARAMS::PPC::SET
            + HCSPARAMS::N_CC.val(3)
            + HCSPARAMS::DEBUG_N.val(1))
        .value;
        let p = HcsParams::from_raw(raw);
        assert_eq!(p.n_ports, 6);
        assert!(p.ppc);
        assert_eq!(p.n_cc, 3);
        assert_eq!(p.debug_port, 1);
        assert!(!p.indicator);
    }

    #[test]
    fn test_op_register_layout() {
        assert_eq!(core::mem::offset_of!(EhciOpRegisters, configflag), 0x40);
        assert_eq!(core::mem::offset_of!(EhciOpRegisters, portsc), 0x44);
    }
}
