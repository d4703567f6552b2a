//! Hub 类请求处理
//!
//! 上层 Hub 驱动把 Root Hub 当作普通 USB 2.0 Hub 使用，
//! 这里把 GetPortStatus / SetPortFeature / ClearPortFeature 等请求翻译成寄存器操作。

use usb_if::host::hub::{
    HubCharacteristics, HubDescriptor, HubFeature, HubRequest, OverCurrentMode, PortFeature,
    PortStatusWord, PowerSwitchingMode,
};

use super::{EhciRootHub, Inner, RhState};
use crate::{
    err::{HubError, Result},
    port::HubEnv,
    reg::{EhciRegisters, PortSc, UsbCmd},
};

/// bPwrOn2PwrGood，单位 2ms
const POWER_GOOD_TIME: u8 = 10;

impl<R: EhciRegisters> EhciRootHub<R> {
    /// 原始请求入口：按 `wValue`/`wIndex` 解码后分发，返回写入 `buf` 的字节数。
    pub fn hub_control(&self, request: u16, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        let request = HubRequest::try_from(request).map_err(|_| {
            debug!("unsupported hub request {request:#06x}");
            HubError::InvalidArgument
        })?;

        match request {
            HubRequest::ClearHubFeature => {
                self.clear_hub_feature(value)?;
                Ok(0)
            }
            HubRequest::SetHubFeature => {
                self.set_hub_feature(value)?;
                Ok(0)
            }
            HubRequest::GetHubStatus => {
                let status = self.hub_status().to_le_bytes();
                write_reply(buf, &status)
            }
            HubRequest::GetHubDescriptor => Ok(self.hub_descriptor().write_to(buf)),
            HubRequest::GetPortStatus => {
                let port = port_from_index(index)?;
                let word = self.get_port_status(port)?;
                write_reply(buf, &word.to_le_bytes())
            }
            HubRequest::ClearPortFeature => {
                let port = port_from_index(index)?;
                self.clear_port_feature(port, decode_feature(value)?)?;
                Ok(0)
            }
            HubRequest::SetPortFeature => {
                // 测试模式选择子在 wIndex 高字节
                let selector = (index >> 8) as u8;
                let port = (index & 0xff) as u8;
                self.set_port_feature(port, decode_feature(value)?, selector)?;
                Ok(0)
            }
        }
    }

    /// GetHubStatus：Root Hub 没有本地电源和全局过流状态
    pub fn hub_status(&self) -> u32 {
        0
    }

    pub fn hub_descriptor(&self) -> HubDescriptor {
        let power_switching = if self.env.params.ppc {
            PowerSwitchingMode::Individual
        } else {
            PowerSwitchingMode::AlwaysPower
        };

        HubDescriptor {
            num_ports: self.port_count() as u8,
            characteristics: HubCharacteristics {
                power_switching,
                compound_device: false,
                over_current_mode: OverCurrentMode::Individual,
                port_indicators: false,
            },
            power_good_time: POWER_GOOD_TIME,
            hub_current: 0,
            device_removable: 0,
        }
    }

    /// Hub 级特性（C_HUB_LOCAL_POWER / C_HUB_OVER_CURRENT）没有对应硬件状态
    pub fn clear_hub_feature(&self, feature: u16) -> Result {
        HubFeature::try_from(feature)
            .map(|_| ())
            .map_err(|_| HubError::InvalidArgument)
    }

    pub fn set_hub_feature(&self, feature: u16) -> Result {
        self.clear_hub_feature(feature)
    }

    pub fn get_port_status(&self, port: u8) -> Result<PortStatusWord> {
        let i = self.port_index(port as u16)?;
        self.lock().get_port_status(i, &self.env)
    }

    /// SetPortFeature，`selector` 只对 PORT_TEST 有意义
    pub fn set_port_feature(&self, port: u8, feature: PortFeature, selector: u8) -> Result {
        let i = self.port_index(port as u16)?;
        let mut g = self.lock();
        let Inner { regs, ports, .. } = &mut *g;

        let sc = regs.read_port(i)?;
        if sc.contains(PortSc::OWNER) {
            trace!("port {port} owned by companion, ignore {feature:?}");
            return Ok(());
        }

        match feature {
            PortFeature::Suspend => ports[i].suspend(regs, &self.env),
            PortFeature::Power => {
                if self.env.params.ppc {
                    regs.write_port(i, sc.for_write() | PortSc::POWER)?;
                }
                Ok(())
            }
            PortFeature::Reset => ports[i].reset(regs, &self.env),
            PortFeature::Test => {
                if !(1..=5).contains(&selector) {
                    return Err(HubError::InvalidArgument);
                }
                g.enter_test_mode(i, selector, &self.env)
            }
            _ => {
                debug!("unsupported SetPortFeature {feature:?}");
                Err(HubError::InvalidArgument)
            }
        }
    }

    pub fn clear_port_feature(&self, port: u8, feature: PortFeature) -> Result {
        let i = self.port_index(port as u16)?;
        let mut g = self.lock();
        let Inner { regs, ports, .. } = &mut *g;

        let sc = regs.read_port(i)?;
        match feature {
            PortFeature::Enable => regs.write_port(i, sc.for_write().difference(PortSc::PE)),
            PortFeature::CEnable => regs.write_port(i, sc.for_write() | PortSc::PEC),
            PortFeature::Suspend => ports[i].resume(regs, &self.env),
            PortFeature::CSuspend => {
                ports[i].change_suspend = false;
                Ok(())
            }
            PortFeature::Power => {
                if self.env.params.ppc {
                    regs.write_port(i, sc.for_write().difference(PortSc::POWER))?;
                }
                Ok(())
            }
            PortFeature::CConnection => regs.write_port(i, sc.for_write() | PortSc::CSC),
            PortFeature::COverCurrent => regs.write_port(i, sc.for_write() | PortSc::OCC),
            PortFeature::CReset => {
                ports[i].change_reset = false;
                Ok(())
            }
            _ => {
                debug!("unsupported ClearPortFeature {feature:?}");
                Err(HubError::InvalidArgument)
            }
        }
    }
}

impl<R: EhciRegisters> Inner<R> {
    /// 进入 USB 2.0 测试模式（7.1.20）
    ///
    /// 先停调度、挂起所有已使能端口、停控制器，再写测试选择子。
    fn enter_test_mode(&mut self, index: usize, selector: u8, env: &HubEnv) -> Result {
        self.quiesce(env)?;

        for i in 0..self.ports.len() {
            let sc = self.regs.read_port(i)?;
            if sc.contains(PortSc::PE) && !sc.contains(PortSc::SUSPEND) {
                self.regs.write_port(i, sc.for_write() | PortSc::SUSPEND)?;
            }
        }

        self.halt(env)?;
        self.command = self.regs.read_command()?.difference(UsbCmd::RUN);

        let sc = self.regs.read_port(index)?;
        self.regs.write_port(
            index,
            sc.for_write().difference(PortSc::TEST) | PortSc::test_selector(selector),
        )?;
        self.rh_state = RhState::Halted;
        info!("port {} enter test mode {selector}", index + 1);
        Ok(())
    }
}

fn port_from_index(index: u16) -> Result<u8> {
    u8::try_from(index).map_err(|_| HubError::InvalidArgument)
}

fn decode_feature(value: u16) -> Result<PortFeature> {
    PortFeature::try_from(value).map_err(|_| {
        debug!("unsupported port feature {value}");
        HubError::InvalidArgument
    })
}

fn write_reply(buf: &mut [u8], data: &[u8]) -> Result<usize> {
    let out = buf
        .get_mut(..data.len())
        .ok_or(HubError::InvalidArgument)?;
    out.copy_from_slice(data);
    Ok(data.len())
}
