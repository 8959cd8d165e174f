//! 进程级日志初始化
//!
//! 组件自身只持有 `tracing::Span`；这里只负责一次性安装全局 subscriber。
//! `RUST_LOG` 存在时优先于传入的级别。

use std::str::FromStr;
use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};
use crate::common::SystError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    #[serde(alias = "WARNING")]
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn  => "warn",
            Self::Info  => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = SystError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR"             => Ok(Self::Error),
            "WARN" | "WARNING"  => Ok(Self::Warn),
            "INFO"              => Ok(Self::Info),
            "DEBUG"             => Ok(Self::Debug),
            "TRACE"             => Ok(Self::Trace),
            other => Err(SystError::Config(format!("unknown log level {other}"))),
        }
    }
}

/// 安装全局 subscriber；已安装过时返回 false
pub fn init(level: LogLevel) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}
