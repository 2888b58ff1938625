//! ビューアのエラー型
//!
//! 各サブシステムのエラーをまとめます。

use crate::cache::{CacheError, DecodeError};
use crate::config::ConfigError;
use crate::network::NetworkError;
use crate::render::RenderError;
use pano_view_rs_common::CommonError;
use std::io;
use thiserror::Error;

/// ビューアエラー
#[derive(Error, Debug)]
pub enum ViewerError {
    /// 設定エラー
    #[error("設定エラー: {0}")]
    Config(#[from] ConfigError),

    /// キャッシュエラー
    #[error("キャッシュエラー: {0}")]
    Cache(#[from] CacheError),

    /// デコードエラー
    #[error("デコードエラー: {0}")]
    Decode(#[from] DecodeError),

    /// 同期エラー
    #[error("同期エラー: {0}")]
    Network(#[from] NetworkError),

    /// 描画エラー
    #[error("描画エラー: {0}")]
    Render(#[from] RenderError),

    /// プロトコルエラー
    #[error("プロトコルエラー: {0}")]
    Protocol(#[from] CommonError),

    /// I/Oエラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] io::Error),

    /// 致命的エラー
    #[error("致命的なエラー: {0}")]
    Fatal(String),
}

/// 結果型のエイリアス
pub type Result<T> = std::result::Result<T, ViewerError>;
