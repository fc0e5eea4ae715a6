//! 协议协商状态机
//!
//! 每个连接一个实例，由连接任务独占。状态只能向前推进，
//! 唯一的回退边是被拒绝的 H2C 升级（H2CUpgrading → Http1Active）。
//! 进入 H2Active 之后不允许降级。

use serde::{Deserialize, Serialize};

use crate::error::{RatError, RatResult};
use crate::server::protocol_detector::Preface;
use crate::utils::logger::debug;

/// 可启用的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// HTTP/1.1
    H1,
    /// HTTP/2 over TLS
    H2,
    /// HTTP/2 明文（先验知识或 Upgrade: h2c）
    H2c,
}

/// 启用的协议集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledProtocols {
    pub h1: bool,
    pub h2: bool,
    pub h2c: bool,
}

impl Default for EnabledProtocols {
    fn default() -> Self {
        Self { h1: true, h2: false, h2c: false }
    }
}

impl EnabledProtocols {
    pub fn from_kinds(kinds: &[ProtocolKind]) -> Self {
        if kinds.is_empty() {
            return Self::default();
        }
        Self {
            h1: kinds.contains(&ProtocolKind::H1),
            h2: kinds.contains(&ProtocolKind::H2),
            h2c: kinds.contains(&ProtocolKind::H2c),
        }
    }

    /// 只启用 H2C：明文 HTTP/1.1 请求必须升级
    pub fn h2c_only(&self) -> bool {
        self.h2c && !self.h1
    }

    /// TLS 握手时通告的 ALPN 协议
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        let mut alpn = Vec::new();
        if self.h2 {
            alpn.push(b"h2".to_vec());
        }
        if self.h1 {
            alpn.push(b"http/1.1".to_vec());
        }
        alpn
    }
}

/// HTTP/2 的进入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2Via {
    Alpn,
    PriorKnowledge,
    Upgrade,
}

/// 协商状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingPreface,
    Http1Active,
    H2cUpgrading,
    H2Active { via: H2Via },
    Failed,
}

/// 协议协商器
#[derive(Debug)]
pub struct ProtocolNegotiator {
    enabled: EnabledProtocols,
    state: NegotiationState,
    upgrade_attempted: bool,
}

impl ProtocolNegotiator {
    pub fn new(enabled: EnabledProtocols) -> Self {
        Self {
            enabled,
            state: NegotiationState::AwaitingPreface,
            upgrade_attempted: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn enabled(&self) -> EnabledProtocols {
        self.enabled
    }

    pub fn is_h2(&self) -> bool {
        matches!(self.state, NegotiationState::H2Active { .. })
    }

    pub fn upgrade_in_progress(&self) -> bool {
        self.state == NegotiationState::H2cUpgrading
    }

    fn transition(&mut self, next: NegotiationState) -> RatResult<NegotiationState> {
        debug!("🔀 [ProtocolNegotiator] {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(next)
    }

    fn fail(&mut self, reason: String) -> RatResult<NegotiationState> {
        debug!("🚫 [ProtocolNegotiator] {:?} 协商失败: {}", self.state, reason);
        self.state = NegotiationState::Failed;
        Err(RatError::Protocol(reason))
    }

    fn expect_awaiting(&self, event: &str) -> RatResult<()> {
        match self.state {
            NegotiationState::AwaitingPreface => Ok(()),
            other => Err(RatError::Protocol(format!("状态 {:?} 下不能处理 {}", other, event))),
        }
    }

    /// 处理明文连接的前言
    pub fn on_preface(&mut self, preface: Preface) -> RatResult<NegotiationState> {
        self.expect_awaiting("前言")?;
        match preface {
            Preface::Http2 if self.enabled.h2c => {
                self.transition(NegotiationState::H2Active { via: H2Via::PriorKnowledge })
            }
            Preface::Http2 => self.fail("未启用 H2C，拒绝 HTTP/2 先验知识连接".to_string()),
            Preface::Http1 if self.enabled.h1 || self.enabled.h2c => {
                self.transition(NegotiationState::Http1Active)
            }
            Preface::Http1 => self.fail("未启用 HTTP/1.1".to_string()),
            // TLS 由 on_alpn 处理，状态保持不变
            Preface::Tls => Ok(self.state),
            Preface::Incomplete | Preface::Malformed => self.fail("无法识别的连接前言".to_string()),
        }
    }

    /// 处理 TLS 握手后的 ALPN 结果
    pub fn on_alpn(&mut self, alpn: Option<&[u8]>) -> RatResult<NegotiationState> {
        self.expect_awaiting("ALPN")?;
        match alpn {
            Some(b"h2") if self.enabled.h2 => self.transition(NegotiationState::H2Active { via: H2Via::Alpn }),
            Some(b"http/1.1") | None if self.enabled.h1 => self.transition(NegotiationState::Http1Active),
            other => {
                let name = other.map(|p| String::from_utf8_lossy(p).into_owned());
                self.fail(format!("ALPN 协议 {:?} 未启用", name))
            }
        }
    }

    /// 开始 H2C 升级，每个连接最多一次
    pub fn begin_h2c_upgrade(&mut self) -> RatResult<NegotiationState> {
        if !self.enabled.h2c {
            return Err(RatError::Protocol("未启用 H2C".to_string()));
        }
        if self.upgrade_attempted {
            return Err(RatError::Protocol("同一连接只能尝试一次 H2C 升级".to_string()));
        }
        match self.state {
            NegotiationState::Http1Active => {
                self.upgrade_attempted = true;
                self.transition(NegotiationState::H2cUpgrading)
            }
            other => Err(RatError::Protocol(format!("状态 {:?} 下不能开始 H2C 升级", other))),
        }
    }

    /// 升级完成，进入 HTTP/2
    pub fn complete_h2c_upgrade(&mut self) -> RatResult<NegotiationState> {
        match self.state {
            NegotiationState::H2cUpgrading => self.transition(NegotiationState::H2Active { via: H2Via::Upgrade }),
            other => Err(RatError::Protocol(format!("状态 {:?} 下不能完成 H2C 升级", other))),
        }
    }

    /// 升级被拒绝，回到 HTTP/1.1
    pub fn abort_h2c_upgrade(&mut self) -> RatResult<NegotiationState> {
        match self.state {
            NegotiationState::H2cUpgrading => self.transition(NegotiationState::Http1Active),
            other => Err(RatError::Protocol(format!("状态 {:?} 下不能放弃 H2C 升级", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(kinds: &[ProtocolKind]) -> ProtocolNegotiator {
        ProtocolNegotiator::new(EnabledProtocols::from_kinds(kinds))
    }

    #[test]
    fn test_prior_knowledge_requires_h2c() {
        let mut n = negotiator(&[ProtocolKind::H1]);
        assert!(n.on_preface(Preface::Http2).is_err());
        assert_eq!(n.state(), NegotiationState::Failed);

        let mut n = negotiator(&[ProtocolKind::H1, ProtocolKind::H2c]);
        assert_eq!(
            n.on_preface(Preface::Http2).unwrap(),
            NegotiationState::H2Active { via: H2Via::PriorKnowledge }
        );
    }

    #[test]
    fn test_upgrade_round_trip_and_decline() {
        let mut n = negotiator(&[ProtocolKind::H2c]);
        assert!(n.enabled().h2c_only());
        n.on_preface(Preface::Http1).unwrap();
        n.begin_h2c_upgrade().unwrap();
        assert!(n.upgrade_in_progress());
        assert_eq!(n.abort_h2c_upgrade().unwrap(), NegotiationState::Http1Active);
        // 同一连接不能再次升级
        assert!(n.begin_h2c_upgrade().is_err());

        let mut n = negotiator(&[ProtocolKind::H1, ProtocolKind::H2c]);
        n.on_preface(Preface::Http1).unwrap();
        n.begin_h2c_upgrade().unwrap();
        assert_eq!(n.complete_h2c_upgrade().unwrap(), NegotiationState::H2Active { via: H2Via::Upgrade });
    }

    #[test]
    fn test_no_downgrade_from_h2() {
        let mut n = negotiator(&[ProtocolKind::H1, ProtocolKind::H2c]);
        n.on_preface(Preface::Http2).unwrap();
        assert!(n.abort_h2c_upgrade().is_err());
        assert!(n.begin_h2c_upgrade().is_err());
        assert!(n.on_preface(Preface::Http1).is_err());
        assert!(n.on_alpn(Some(b"http/1.1")).is_err());
        assert!(n.is_h2());
    }

    #[test]
    fn test_alpn_selection() {
        let mut n = negotiator(&[ProtocolKind::H1, ProtocolKind::H2]);
        assert_eq!(n.on_alpn(Some(b"h2")).unwrap(), NegotiationState::H2Active { via: H2Via::Alpn });

        let mut n = negotiator(&[ProtocolKind::H1, ProtocolKind::H2]);
        assert_eq!(n.on_alpn(None).unwrap(), NegotiationState::Http1Active);

        let mut n = negotiator(&[ProtocolKind::H2]);
        assert!(n.on_alpn(Some(b"http/1.1")).is_err());
        assert_eq!(
            EnabledProtocols::from_kinds(&[ProtocolKind::H1, ProtocolKind::H2]).alpn_protocols(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_malformed_preface_fails() {
        let mut n = negotiator(&[ProtocolKind::H1]);
        assert!(matches!(n.on_preface(Preface::Malformed), Err(RatError::Protocol(_))));
    }
}
