//! パノラマビューア共通ライブラリ
//!
//! このクレートは、複数のビューアインスタンス間で共有される型を提供します。
//! 同期メッセージのワイヤ形式と、コマンドチャネルの行文法を含みます。
//! スレッドやソケットは扱いません。

pub mod error;
pub mod protocol;

// 主要コンポーネントを再エクスポート
pub use error::{CommonError, Result};
pub use protocol::{SyncMessage, ViewerCommand, SYNC_MAGIC, SYNC_MESSAGE_SIZE};

/// ライブラリのバージョン
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
