/// EHCI Root Hub 策略配置
///
/// 硬件能力（端口数、电源开关）从 HCSPARAMS 读取，这里只放平台/策略相关的开关。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhciConfig {
    /// 忽略过流变化（某些主板会上报虚假过流）
    pub ignore_oc: bool,

    /// 控制器集成 TT（TDI 类），没有 companion 可以交接
    pub integrated_tt: bool,

    /// 专门交给 companion 的端口位图，bit i 对应端口 i+1
    pub companion_ports: u32,

    /// Root Hub 允许远程唤醒
    pub remote_wakeup: bool,

    /// 禁止选择性挂起单个端口
    pub no_selective_suspend: bool,
}

impl Default for EhciConfig {
    fn default() -> Self {
        Self {
            ignore_oc: false,
            integrated_tt: false,
            companion_ports: 0,
            remote_wakeup: true,
            no_selective_suspend: false,
        }
    }
}

impl EhciConfig {
    /// 把端口（1-based）标记为 companion 专用
    pub fn with_companion_port(mut self, port: u8) -> Self {
        if (1..=32).contains(&port) {
            self.companion_ports |= 1 << (port - 1);
        }
        self
    }

    pub(crate) fn is_companion_port(&self, index: usize) -> bool {
        index < 32 && self.companion_ports & (1 << index) != 0
    }
}
