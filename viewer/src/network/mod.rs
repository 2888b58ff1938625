//! 同期モジュール
//!
//! マスターの表示状態を UDP でスレーブに複製します。
//! 役割は起動時に一度だけ決まり、実行中に切り替わることはありません。

pub mod master;
pub mod slave;

pub use master::SyncMaster;
pub use slave::SyncSlave;

use pano_view_rs_common::CommonError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// スレーブの最大数
pub const MAX_SLAVES: usize = 30;

/// ネットワークエラー
#[derive(Error, Debug)]
pub enum NetworkError {
    /// I/Oエラー
    #[error("I/Oエラー: {0}")]
    IoError(#[from] io::Error),

    /// バインド失敗
    #[error("{addr} にバインドできません: {source}")]
    Bind {
        /// アドレス
        addr: String,
        /// 原因
        source: io::Error,
    },

    /// 接続失敗
    #[error("{addr} に接続できません: {source}")]
    Connect {
        /// アドレス
        addr: String,
        /// 原因
        source: io::Error,
    },

    /// プレイリストの不一致
    #[error("プレイリストが同期していません: インデックス {index}（全{len}件）")]
    Desynchronized {
        /// 受信したインデックス
        index: i32,
        /// ローカルのプレイリスト長
        len: usize,
    },

    /// スレーブが多すぎる
    #[error("スレーブが多すぎます: {0}（最大{max}）", max = MAX_SLAVES)]
    TooManySlaves(usize),

    /// スレーブ指定の誤り
    #[error("不正なスレーブ指定: {0}")]
    InvalidSlave(String),

    /// プロトコルエラー
    #[error("プロトコルエラー: {0}")]
    Protocol(#[from] CommonError),
}

/// スレーブの送信先
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveDescriptor {
    /// ホスト名またはアドレス
    pub host: String,
    /// ポート番号
    pub port: u16,
    /// ブロードキャストアドレスか
    #[serde(default)]
    pub broadcast: bool,
}

impl SlaveDescriptor {
    /// `host:port` 形式から作成
    pub fn parse(spec: &str, broadcast: bool) -> Result<Self, NetworkError> {
        let invalid = || NetworkError::InvalidSlave(spec.to_string());
        let (host, port) = spec.trim().rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            broadcast,
        })
    }

    /// 送信先の表記
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for SlaveDescriptor {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, false)
    }
}

impl fmt::Display for SlaveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())?;
        if self.broadcast {
            write!(f, " (broadcast)")?;
        }
        Ok(())
    }
}

/// 同期の役割
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRole {
    /// 同期しない
    None,
    /// 表示状態を送信する
    Master {
        /// 送信先
        slaves: Vec<SlaveDescriptor>,
    },
    /// 表示状態を受信する
    Slave {
        /// 待ち受けアドレス
        listen_addr: IpAddr,
        /// 待ち受けポート
        port: u16,
        /// 参加するマルチキャストグループ
        multicast: Option<Ipv4Addr>,
    },
}

impl SyncRole {
    /// 役割名
    pub fn name(&self) -> &'static str {
        match self {
            SyncRole::None => "none",
            SyncRole::Master { .. } => "master",
            SyncRole::Slave { .. } => "slave",
        }
    }
}
