//! 通信プロトコル定義
//!
//! ビューア間で送受信される同期メッセージと、外部チャネルから届く
//! テキストコマンドを定義します。
//!
//! 同期メッセージはバージョンフィールドを持たない固定レイアウトです。
//! マスターとスレーブは同じレイアウトでビルドされている必要があります。

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// 同期メッセージのマジックタグ
pub const SYNC_MAGIC: i32 = 1234;

/// 同期メッセージのバイト長（タグ + インデックス + dx + dy + z）
pub const SYNC_MESSAGE_SIZE: usize = 20;

/// 同期メッセージ
///
/// ワイヤ上ではネイティブバイトオーダーの
/// `i32 magic, i32 index, f32 dx, f32 dy, f32 z` として1データグラムで送られます。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// プレイリスト上のインデックス
    pub index: i32,
    /// 水平方向の平行移動（ソース画素単位）
    pub dx: f32,
    /// 垂直方向の平行移動（ソース画素単位）
    pub dy: f32,
    /// ズーム倍率（出力1画素あたりのソース画素数）
    pub z: f32,
}

impl SyncMessage {
    /// 新しい同期メッセージを作成
    pub fn new(index: i32, dx: f32, dy: f32, z: f32) -> Self {
        Self { index, dx, dy, z }
    }

    /// ワイヤ形式にエンコード
    pub fn encode(&self) -> [u8; SYNC_MESSAGE_SIZE] {
        let mut buf = [0u8; SYNC_MESSAGE_SIZE];
        buf[0..4].copy_from_slice(&SYNC_MAGIC.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.index.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.dx.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.dy.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.z.to_ne_bytes());
        buf
    }

    /// ワイヤ形式からデコード
    ///
    /// 末尾の余分なバイトは無視します。
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SYNC_MESSAGE_SIZE {
            return Err(CommonError::Truncated {
                expected: SYNC_MESSAGE_SIZE,
                actual: buf.len(),
            });
        }

        let magic = i32::from_ne_bytes(word(buf, 0));
        if magic != SYNC_MAGIC {
            return Err(CommonError::BadMagic(magic));
        }

        Ok(Self {
            index: i32::from_ne_bytes(word(buf, 4)),
            dx: f32::from_ne_bytes(word(buf, 8)),
            dy: f32::from_ne_bytes(word(buf, 12)),
            z: f32::from_ne_bytes(word(buf, 16)),
        })
    }
}

fn word(buf: &[u8], offset: usize) -> [u8; 4] {
    [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]
}

/// コマンドチャネルから届くコマンド
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ViewerCommand {
    /// 画像を読み込む（`l <path>`）
    Load {
        /// 画像ファイルのパス
        path: PathBuf,
    },

    /// 絶対ズーム（`z <level>`）。0以下はウィンドウに合わせる
    Zoom {
        /// ズーム倍率
        level: f32,
    },

    /// ソース座標を中心に表示（`c <x> <y>`）
    Center {
        /// X座標
        x: i32,
        /// Y座標
        y: i32,
    },

    /// 相対移動（`m <dx> <dy>`）
    Move {
        /// X方向の移動量
        dx: i32,
        /// Y方向の移動量
        dy: i32,
    },

    /// 終了（`q`）
    Quit,
}

impl ViewerCommand {
    /// 1行のコマンドを解析
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        let malformed = || CommonError::MalformedCommand(line.to_string());

        let trimmed = line.trim_start();
        let (verb, rest) = match trimmed.find(char::is_whitespace) {
            Some(pos) => (&trimmed[..pos], &trimmed[pos..]),
            None => (trimmed, ""),
        };

        match verb {
            "l" => {
                // パスには空白が含まれ得るので残りをそのまま使う
                let path = rest.trim();
                if path.is_empty() {
                    return Err(malformed());
                }
                Ok(ViewerCommand::Load { path: PathBuf::from(path) })
            },
            "z" => {
                let args = arguments(rest);
                match args.as_slice() {
                    [level] => {
                        let level = level.parse::<f32>().map_err(|_| malformed())?;
                        if level.is_nan() {
                            return Err(malformed());
                        }
                        Ok(ViewerCommand::Zoom { level })
                    },
                    _ => Err(malformed()),
                }
            },
            "c" | "m" => {
                let args = arguments(rest);
                let (a, b) = match args.as_slice() {
                    [a, b] => (
                        a.parse::<i32>().map_err(|_| malformed())?,
                        b.parse::<i32>().map_err(|_| malformed())?,
                    ),
                    _ => return Err(malformed()),
                };
                if verb == "c" {
                    Ok(ViewerCommand::Center { x: a, y: b })
                } else {
                    Ok(ViewerCommand::Move { dx: a, dy: b })
                }
            },
            "q" if rest.trim().is_empty() => Ok(ViewerCommand::Quit),
            _ => Err(malformed()),
        }
    }

    /// コマンドをプロトコル文字列に変換
    pub fn to_protocol_string(&self) -> String {
        match self {
            ViewerCommand::Load { path } => format!("l {}", path.display()),
            ViewerCommand::Zoom { level } => format!("z {}", level),
            ViewerCommand::Center { x, y } => format!("c {} {}", x, y),
            ViewerCommand::Move { dx, dy } => format!("m {} {}", dx, dy),
            ViewerCommand::Quit => String::from("q"),
        }
    }
}

fn arguments(rest: &str) -> Vec<&str> {
    rest.split_whitespace().collect()
}

impl FromStr for ViewerCommand {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ViewerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_protocol_string())
    }
}
