//! エラー型定義
//!
//! 同期プロトコルとコマンド文法で使用する共通エラー型を定義します。

use std::io;
use thiserror::Error;

/// 共通エラー
#[derive(Error, Debug)]
pub enum CommonError {
    /// 入出力エラー
    #[error("I/Oエラー: {0}")]
    IoError(#[from] io::Error),

    /// データグラムが短すぎる
    #[error("同期メッセージが短すぎます: {actual} バイト（{expected} バイト必要）")]
    Truncated {
        /// 必要なバイト数
        expected: usize,
        /// 受信したバイト数
        actual: usize,
    },

    /// マジックタグの不一致
    #[error("同期メッセージのマジックタグが不正です: {0}")]
    BadMagic(i32),

    /// 解釈できないコマンド行
    #[error("不正なコマンド: {0:?}")]
    MalformedCommand(String),
}

/// 結果型のエイリアス
pub type Result<T> = std::result::Result<T, CommonError>;
