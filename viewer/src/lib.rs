//! パノラマビューアライブラリ
//!
//! 画像キャッシュ、並列描画、表示状態の UDP 同期、コマンドチャネルを提供します。

pub mod app;
pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod network;
pub mod playlist;
pub mod render;
pub mod view;

pub use app::App;
pub use config::ViewerSettings;
pub use error::{Result, ViewerError};
