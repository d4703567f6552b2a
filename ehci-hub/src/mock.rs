//! 测试用的 EHCI 寄存器模型和时钟
//!
//! 只模拟端口状态机关心的硬件行为：RWC 位、复位/恢复结束、归属切换、RUN/HALT。

use alloc::{sync::Arc, vec::Vec};
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use spin::Mutex;

use crate::{
    err::{RegError, Result},
    osal::Kernel,
    reg::{EhciRegisters, HcsParams, PortSc, UsbCmd, UsbSts},
};

/// 调用 `delay` 时直接推进时间的时钟
#[derive(Default)]
pub struct MockKernel {
    now_us: AtomicU64,
}

impl MockKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, duration: Duration) {
        self.now_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Kernel for MockKernel {
    fn now(&self) -> Duration {
        Duration::from_micros(self.now_us.load(Ordering::SeqCst))
    }

    fn delay(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimSpeed {
    Low,
    Full,
    High,
}

#[derive(Debug, Default)]
struct SimPort {
    value: PortSc,
    device: Option<SimSpeed>,
    /// 写 0 后 RESET 不清除
    reset_stuck: bool,
    /// 写 0 后 RESUME 不清除
    resume_stuck: bool,
}

struct SimState {
    params: HcsParams,
    ports: Vec<SimPort>,
    command: UsbCmd,
    status: UsbSts,
    intr: UsbSts,
    port_writes: Vec<(usize, PortSc)>,
    fail: bool,
    accessible: bool,
}

/// 可在测试和 Root Hub 之间共享的寄存器模型
#[derive(Clone)]
pub struct SimRegisters {
    state: Arc<Mutex<SimState>>,
}

impl SimRegisters {
    pub fn new(n_ports: u8, ppc: bool) -> Self {
        let ports = (0..n_ports)
            .map(|_| SimPort {
                value: if ppc { PortSc::empty() } else { PortSc::POWER },
                ..Default::default()
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                params: HcsParams {
                    n_ports,
                    ppc,
                    n_cc: 1,
                    indicator: false,
                    debug_port: 0,
                },
                ports,
                command: UsbCmd::empty(),
                status: UsbSts::HALT,
                intr: UsbSts::empty(),
                port_writes: Vec::new(),
                fail: false,
                accessible: true,
            })),
        }
    }

    /// 1-based 端口号上接入设备
    pub fn attach(&self, port: usize, speed: SimSpeed) {
        let mut s = self.state.lock();
        let p = &mut s.ports[port - 1];
        p.device = Some(speed);
        p.value.remove(PortSc::LINE_STATUS);
        let line = match speed {
            SimSpeed::Low => 1 << 10,
            SimSpeed::Full | SimSpeed::High => 2 << 10,
        };
        p.value |= PortSc::CONNECT | PortSc::CSC | PortSc::from_raw(line);
        s.status |= UsbSts::PCD;
    }

    pub fn detach(&self, port: usize) {
        let mut s = self.state.lock();
        let p = &mut s.ports[port - 1];
        p.device = None;
        if p.value.contains(PortSc::PE) {
            p.value |= PortSc::PEC;
        }
        p.value.remove(
            PortSc::CONNECT
                | PortSc::PE
                | PortSc::SUSPEND
                | PortSc::RESUME
                | PortSc::LINE_STATUS
                | PortSc::OWNER,
        );
        p.value |= PortSc::CSC;
        s.status |= UsbSts::PCD;
    }

    /// 设备在挂起端口上发起远程唤醒
    pub fn remote_wakeup(&self, port: usize) {
        let mut s = self.state.lock();
        s.ports[port - 1].value |= PortSc::RESUME;
        s.status |= UsbSts::PCD;
    }

    pub fn over_current(&self, port: usize) {
        let mut s = self.state.lock();
        s.ports[port - 1].value |= PortSc::OC | PortSc::OCC;
        s.status |= UsbSts::PCD;
    }

    /// 控制器掉电：companion 归属丢失
    pub fn power_loss(&self) {
        let mut s = self.state.lock();
        for p in s.ports.iter_mut() {
            p.value.remove(PortSc::OWNER);
        }
        s.intr = UsbSts::empty();
    }

    pub fn set_reset_stuck(&self, port: usize, stuck: bool) {
        self.state.lock().ports[port - 1].reset_stuck = stuck;
    }

    pub fn set_resume_stuck(&self, port: usize, stuck: bool) {
        self.state.lock().ports[port - 1].resume_stuck = stuck;
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn set_accessible(&self, accessible: bool) {
        self.state.lock().accessible = accessible;
    }

    pub fn port(&self, port: usize) -> PortSc {
        self.state.lock().ports[port - 1].value
    }

    pub fn command(&self) -> UsbCmd {
        self.state.lock().command
    }

    pub fn status(&self) -> UsbSts {
        self.state.lock().status
    }

    pub fn intr_enable(&self) -> UsbSts {
        self.state.lock().intr
    }

    pub fn clear_writes(&self) {
        self.state.lock().port_writes.clear();
    }

    /// 1-based 端口上满足条件的写次数
    pub fn count_writes(&self, port: usize, f: impl Fn(PortSc) -> bool) -> usize {
        self.state
            .lock()
            .port_writes
            .iter()
            .filter(|(i, v)| *i == port - 1 && f(*v))
            .count()
    }

    fn check(&self) -> Result {
        if self.state.lock().fail {
            return Err(RegError { offset: 0 }.into());
        }
        Ok(())
    }
}

impl SimPort {
    fn write(&mut self, v: PortSc) {
        let old = self.value;
        let mut new = old;

        new.remove(v.intersection(PortSc::RWC));

        // 软件只能关闭 PE
        if !v.contains(PortSc::PE) {
            new.remove(PortSc::PE);
        }

        if v.contains(PortSc::RESET) && !old.contains(PortSc::RESET) {
            new |= PortSc::RESET;
            new.remove(PortSc::PE | PortSc::SUSPEND | PortSc::RESUME);
        } else if !v.contains(PortSc::RESET) && old.contains(PortSc::RESET) && !self.reset_stuck {
            new.remove(PortSc::RESET);
            if self.device == Some(SimSpeed::High) {
                new |= PortSc::PE;
            }
        }

        if v.contains(PortSc::SUSPEND) && new.contains(PortSc::PE) {
            new |= PortSc::SUSPEND;
        }

        if v.contains(PortSc::RESUME) {
            new |= PortSc::RESUME;
        } else if old.contains(PortSc::RESUME) && !self.resume_stuck {
            new.remove(PortSc::RESUME | PortSc::SUSPEND);
        }

        new.set(PortSc::POWER, v.contains(PortSc::POWER));

        if v.contains(PortSc::OWNER) && !old.contains(PortSc::OWNER) {
            // 使能状态下拒绝交出归属
            if !old.contains(PortSc::PE) {
                new |= PortSc::OWNER;
                new.remove(PortSc::PE);
            }
        } else if !v.contains(PortSc::OWNER) {
            new.remove(PortSc::OWNER);
        }

        let passthrough = PortSc::WAKE | PortSc::TEST | PortSc::INDICATOR;
        new.remove(passthrough);
        new |= v.intersection(passthrough);

        self.value = new;
    }
}

impl EhciRegisters for SimRegisters {
    fn hcs_params(&self) -> Result<HcsParams> {
        self.check()?;
        Ok(self.state.lock().params)
    }

    fn read_port(&mut self, index: usize) -> Result<PortSc> {
        self.check()?;
        let s = self.state.lock();
        s.ports
            .get(index)
            .map(|p| p.value)
            .ok_or(RegError { offset: 0x44 + index * 4 }.into())
    }

    fn write_port(&mut self, index: usize, value: PortSc) -> Result<()> {
        self.check()?;
        let mut s = self.state.lock();
        s.port_writes.push((index, value));
        s.ports
            .get_mut(index)
            .ok_or(RegError { offset: 0x44 + index * 4 })?
            .write(value);
        Ok(())
    }

    fn read_command(&mut self) -> Result<UsbCmd> {
        self.check()?;
        Ok(self.state.lock().command)
    }

    fn write_command(&mut self, value: UsbCmd) -> Result<()> {
        self.check()?;
        let mut s = self.state.lock();
        s.command = value;
        s.status.set(UsbSts::HALT, !value.contains(UsbCmd::RUN));
        s.status.set(UsbSts::ASS, value.contains(UsbCmd::ASE));
        s.status.set(UsbSts::PSS, value.contains(UsbCmd::PSE));
        Ok(())
    }

    fn read_status(&mut self) -> Result<UsbSts> {
        self.check()?;
        Ok(self.state.lock().status)
    }

    fn write_status(&mut self, value: UsbSts) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .status
            .remove(value.intersection(UsbSts::W1C));
        Ok(())
    }

    fn read_intr_enable(&mut self) -> Result<UsbSts> {
        self.check()?;
        Ok(self.state.lock().intr)
    }

    fn write_intr_enable(&mut self, value: UsbSts) -> Result<()> {
        self.check()?;
        self.state.lock().intr = value;
        Ok(())
    }

    fn accessible(&self) -> bool {
        self.state.lock().accessible
    }
}
