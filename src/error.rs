use std::io;

use thiserror::Error;

/// Per-packet and startup failures. / 单包处理与启动阶段的错误
#[derive(Debug, Error)]
pub enum Error {
    /// 报文在声明的长度内被截断或结构非法。
    #[error("dns message truncated or malformed")]
    Truncated,

    /// 上游响应的 ID 没有对应的转换表项。
    #[error("no outstanding query with id {0:#06x}")]
    UnknownQuery(u16),

    #[error("transport error: {0}")]
    Transport(io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
