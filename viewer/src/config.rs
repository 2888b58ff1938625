//! ビューア設定
//!
//! 設定ファイル（TOML または JSON）の読み書きと、同期の役割の検証を行います。

use crate::cache::preload::DEFAULT_PRELOAD_INTERVAL;
use crate::cache::DEFAULT_CAPACITY;
use crate::network::{SlaveDescriptor, SyncRole, MAX_SLAVES};
use crate::view::DEFAULT_ZOOM_RANGE;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 設定エラー
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/Oエラー
    #[error("設定ファイルの入出力エラー: {0}")]
    IoError(#[from] io::Error),

    /// TOML の解析エラー
    #[error("TOMLの解析に失敗しました: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML の書き出しエラー
    #[error("TOMLの書き出しに失敗しました: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    /// JSON のエラー
    #[error("JSONの処理に失敗しました: {0}")]
    Json(#[from] serde_json::Error),

    /// 未対応の拡張子
    #[error("対応していない設定ファイル形式です: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// 不正な値
    #[error("不正な設定値: {0}")]
    InvalidValue(String),

    /// 役割の衝突
    #[error("待ち受け（スレーブ）と送信先（マスター）は同時に指定できません")]
    ConflictingRoles,

    /// コマンドチャネルとスレーブの併用
    #[error("コマンドチャネル（fifo）と待ち受け（スレーブ）は同時に指定できません")]
    FifoOnSlave,

    /// スレーブが多すぎる
    #[error("スレーブが多すぎます: {0}（最大{max}）", max = MAX_SLAVES)]
    TooManySlaves(usize),
}

/// 設定ファイルの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// 拡張子から形式を判定
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// ビューア設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    /// 表示設定
    pub display: DisplaySettings,
    /// 描画設定
    pub render: RenderSettings,
    /// キャッシュ設定
    pub cache: CacheSettings,
    /// 同期設定
    pub sync: SyncSettings,
    /// コマンドチャネル設定
    pub command: CommandSettings,
    /// プレイリスト設定
    pub playlist: PlaylistSettings,
}

/// 表示設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// 幅
    pub width: u32,
    /// 高さ
    pub height: u32,
    /// 水平オフセット
    pub x_offset: i32,
    /// 垂直オフセット
    pub y_offset: i32,
    /// ウィンドウを持たずに描画する
    pub headless: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            x_offset: 0,
            y_offset: 0,
            headless: true,
        }
    }
}

impl DisplaySettings {
    /// `WxH+X+Y` 形式のジオメトリを適用
    ///
    /// オフセットは省略できます。
    pub fn apply_geometry(&mut self, geometry: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue(format!("ジオメトリ: {}", geometry));

        let is_sign = |c: char| c == '+' || c == '-';
        let (size, offsets) = match geometry.find(is_sign) {
            Some(pos) => geometry.split_at(pos),
            None => (geometry, ""),
        };
        let (width, height) = size.split_once(|c: char| c == 'x' || c == 'X').ok_or_else(invalid)?;
        let width = width.parse::<u32>().map_err(|_| invalid())?;
        let height = height.parse::<u32>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }

        let (x_offset, y_offset) = if offsets.is_empty() {
            (0, 0)
        } else {
            let split = offsets[1..].find(is_sign).map(|pos| pos + 1).ok_or_else(invalid)?;
            let (x, y) = offsets.split_at(split);
            (parse_offset(x).ok_or_else(invalid)?, parse_offset(y).ok_or_else(invalid)?)
        };

        self.width = width;
        self.height = height;
        self.x_offset = x_offset;
        self.y_offset = y_offset;
        Ok(())
    }
}

fn parse_offset(text: &str) -> Option<i32> {
    text.strip_prefix('+').unwrap_or(text).parse().ok()
}

/// 描画設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// 描画スレッド数（未指定ならCPUコア数）
    pub threads: Option<usize>,
    /// バイリニア補間
    pub bilinear: bool,
    /// パノラマ（水平方向の折り返し）
    pub panorama: bool,
    /// ズーム範囲
    pub zoom_range: f64,
    /// 最短の待機時間（ミリ秒）
    pub idle_min_ms: u64,
    /// 最長の待機時間（ミリ秒）
    pub idle_max_ms: u64,
    /// 待機時間の増加率
    pub idle_growth: f64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            threads: None,
            bilinear: false,
            panorama: false,
            zoom_range: DEFAULT_ZOOM_RANGE,
            idle_min_ms: 5,
            idle_max_ms: 200,
            idle_growth: 1.02,
        }
    }
}

/// キャッシュ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// スロット数
    pub capacity: usize,
    /// 先読み間隔（ミリ秒）
    pub preload_interval_ms: u64,
    /// 読み込み失敗時に表示する画像
    pub default_image: Option<PathBuf>,
    /// EXIF の向きに従って回転する
    pub autorotate: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            preload_interval_ms: DEFAULT_PRELOAD_INTERVAL.as_millis() as u64,
            default_image: None,
            autorotate: true,
        }
    }
}

/// 同期設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// 待ち受けアドレス
    pub listen_addr: Option<String>,
    /// 待ち受けポート（指定するとスレーブになる）
    pub listen_port: Option<u16>,
    /// 参加するマルチキャストグループ
    pub multicast: Option<String>,
    /// 送信先（指定するとマスターになる）
    pub slaves: Vec<SlaveDescriptor>,
}

impl SyncSettings {
    /// 設定から同期の役割を決める
    pub fn role(&self) -> Result<SyncRole, ConfigError> {
        let listening = self.listen_port.is_some();
        if listening && !self.slaves.is_empty() {
            return Err(ConfigError::ConflictingRoles);
        }
        if self.slaves.len() > MAX_SLAVES {
            return Err(ConfigError::TooManySlaves(self.slaves.len()));
        }
        for slave in &self.slaves {
            if slave.host.is_empty() || slave.port == 0 {
                return Err(ConfigError::InvalidValue(format!("スレーブ: {}", slave)));
            }
        }

        if let Some(port) = self.listen_port {
            let listen_addr = match &self.listen_addr {
                Some(addr) => resolve_listen_addr(addr, port)?,
                None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            };
            let multicast = match &self.multicast {
                Some(group) => {
                    let group = group
                        .parse::<Ipv4Addr>()
                        .ok()
                        .filter(Ipv4Addr::is_multicast)
                        .ok_or_else(|| ConfigError::InvalidValue(format!("マルチキャストグループ: {}", group)))?;
                    Some(group)
                },
                None => None,
            };
            return Ok(SyncRole::Slave {
                listen_addr,
                port,
                multicast,
            });
        }

        if self.slaves.is_empty() {
            Ok(SyncRole::None)
        } else {
            Ok(SyncRole::Master {
                slaves: self.slaves.clone(),
            })
        }
    }
}

/// 待ち受けアドレスを解決（ホスト名も可、IPv4 を優先）
fn resolve_listen_addr(addr: &str, port: u16) -> Result<IpAddr, ConfigError> {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(ip);
    }
    let invalid = || ConfigError::InvalidValue(format!("待ち受けアドレス: {}", addr));
    let candidates: Vec<SocketAddr> = (addr, port).to_socket_addrs().map_err(|_| invalid())?.collect();
    candidates
        .iter()
        .find(|candidate| candidate.is_ipv4())
        .or_else(|| candidates.first())
        .map(SocketAddr::ip)
        .ok_or_else(invalid)
}

/// コマンドチャネル設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// 名前付きパイプのパス
    pub fifo: Option<PathBuf>,
}

/// プレイリスト設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistSettings {
    /// 指定ファイルのディレクトリを展開する
    pub browse: bool,
    /// 順序をランダムにする
    pub shuffle: bool,
}

impl ViewerSettings {
    /// 同期の役割を決める
    ///
    /// スレーブはコマンドチャネルを持てません。
    pub fn role(&self) -> Result<SyncRole, ConfigError> {
        let slave_mode = self.sync.listen_port.is_some() || self.sync.listen_addr.is_some();
        if slave_mode && self.command.fifo.is_some() {
            return Err(ConfigError::FifoOnSlave);
        }
        self.sync.role()
    }

    /// 設定ファイルを読み込む
    ///
    /// ファイルがなければデフォルト設定を返します。
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        if !path.exists() {
            info!("設定ファイルがないためデフォルト設定を使用します: {}", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)?;
        let settings = match format {
            ConfigFormat::Toml => toml::from_str(&text)?,
            ConfigFormat::Json => serde_json::from_str(&text)?,
        };
        debug!("設定ファイルを読み込みました: {}", path.display());
        Ok(settings)
    }

    /// 設定ファイルに保存
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, text)?;
        debug!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// デフォルトの設定ファイルパス
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pano-view-rs")
            .join("viewer.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ViewerSettings::default();
        assert_eq!(settings.cache.capacity, 5);
        assert_eq!(settings.render.zoom_range, 16.0);
        assert_eq!(settings.render.idle_min_ms, 5);
        assert_eq!(settings.render.idle_max_ms, 200);
        assert!(settings.cache.autorotate);
        assert_eq!(settings.role().unwrap(), SyncRole::None);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("viewer.toml");
        let mut settings = ViewerSettings::default();
        settings.render.panorama = true;
        settings.cache.default_image = Some(PathBuf::from("/usr/share/pano/default.ppm"));
        settings.sync.slaves.push(SlaveDescriptor::parse("wall-1:5000", true).unwrap());

        settings.save(&path).unwrap();
        let loaded = ViewerSettings::load(&path).unwrap();

        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer.json");
        fs::write(&path, r#"{ "render": { "bilinear": true }, "sync": { "listen_port": 5000 } }"#).unwrap();

        let settings = ViewerSettings::load(&path).unwrap();

        assert!(settings.render.bilinear);
        assert_eq!(settings.render.idle_growth, 1.02);
        assert_eq!(settings.display.width, 1920);
        assert!(matches!(settings.sync.role().unwrap(), SyncRole::Slave { port: 5000, multicast: None, .. }));
    }

    #[test]
    fn test_missing_file_and_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ViewerSettings::load(&dir.path().join("absent.toml")).unwrap(), ViewerSettings::default());
        assert!(matches!(
            ViewerSettings::load(&dir.path().join("viewer.yaml")),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_apply_geometry() {
        let mut display = DisplaySettings::default();

        display.apply_geometry("1280x720+1920+0").unwrap();
        assert_eq!((display.width, display.height, display.x_offset, display.y_offset), (1280, 720, 1920, 0));

        display.apply_geometry("800x600-10+20").unwrap();
        assert_eq!((display.x_offset, display.y_offset), (-10, 20));

        display.apply_geometry("640x480").unwrap();
        assert_eq!((display.width, display.height, display.x_offset), (640, 480, 0));

        for bad in ["", "640", "0x480", "axb", "640x480+1", "640x480+a+b"] {
            assert!(display.apply_geometry(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_role_validation() {
        let mut sync = SyncSettings {
            listen_port: Some(5000),
            slaves: vec![SlaveDescriptor::parse("wall-1:5000", false).unwrap()],
            ..SyncSettings::default()
        };
        assert!(matches!(sync.role(), Err(ConfigError::ConflictingRoles)));

        sync.listen_port = None;
        sync.slaves = (0..=MAX_SLAVES)
            .map(|i| SlaveDescriptor::parse(&format!("wall-{}:5000", i), false).unwrap())
            .collect();
        assert!(matches!(sync.role(), Err(ConfigError::TooManySlaves(31))));

        sync.slaves.truncate(2);
        assert!(matches!(sync.role(), Ok(SyncRole::Master { ref slaves }) if slaves.len() == 2));

        let sync = SyncSettings {
            listen_port: Some(5000),
            multicast: Some("10.0.0.1".to_string()),
            ..SyncSettings::default()
        };
        assert!(matches!(sync.role(), Err(ConfigError::InvalidValue(_))));

        let sync = SyncSettings {
            listen_port: Some(5000),
            multicast: Some("239.1.2.3".to_string()),
            ..SyncSettings::default()
        };
        assert!(matches!(
            sync.role(),
            Ok(SyncRole::Slave { multicast: Some(group), .. }) if group == Ipv4Addr::new(239, 1, 2, 3)
        ));
    }

    #[test]
    fn test_fifo_is_rejected_on_slave() {
        let mut settings = ViewerSettings::default();
        settings.command.fifo = Some(PathBuf::from("/tmp/pano.fifo"));
        assert_eq!(settings.role().unwrap(), SyncRole::None);

        settings.sync.listen_port = Some(5000);
        assert!(matches!(settings.role(), Err(ConfigError::FifoOnSlave)));

        settings.sync.listen_port = None;
        settings.sync.listen_addr = Some("127.0.0.1".to_string());
        assert!(matches!(settings.role(), Err(ConfigError::FifoOnSlave)));
    }

    #[test]
    fn test_listen_addr_accepts_hostname() {
        let sync = SyncSettings {
            listen_addr: Some("localhost".to_string()),
            listen_port: Some(5000),
            ..SyncSettings::default()
        };
        match sync.role().unwrap() {
            SyncRole::Slave { listen_addr, .. } => assert!(listen_addr.is_loopback()),
            other => panic!("unexpected role: {:?}", other),
        }

        let sync = SyncSettings {
            listen_addr: Some("no such host!".to_string()),
            listen_port: Some(5000),
            ..SyncSettings::default()
        };
        assert!(matches!(sync.role(), Err(ConfigError::InvalidValue(_))));
    }
}
