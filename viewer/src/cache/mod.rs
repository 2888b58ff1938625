//! 画像キャッシュモジュール
//!
//! デコード済み画像を固定数のスロットに保持します。
//! 同じパスのデコードは同時に1つだけ実行され、後から来た呼び出し元は
//! 状態が確定するまで条件変数で待機します。
//!
//! 追い出しは挿入順の巡回上書きで、アクセス頻度には依存しません。

pub mod decoder;
pub mod preload;

// 主要なコンポーネントを再エクスポート
pub use decoder::{DecodeError, DecodedImage, ExternalConverter, FallbackDecoder, ImageDecoder, Orientation, PixelBuffer};
pub use preload::Preloader;

use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// デフォルトのスロット数
pub const DEFAULT_CAPACITY: usize = 5;

/// キャッシュエラー
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// デコード失敗
    #[error("画像を読み込めません: {}: {reason}", .path.display())]
    DecodeFailed {
        /// 画像のパス
        path: PathBuf,
        /// 失敗理由
        reason: String,
    },

    /// 容量設定エラー
    #[error("キャッシュ容量が不正です: {0}")]
    InvalidCapacity(usize),
}

/// 画像の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// デコード中
    InProgress,
    /// 利用可能
    Ready,
    /// デコード失敗
    Error,
}

/// デコード済み画像
///
/// 準備完了後は不変です。
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    width: u32,
    height: u32,
    max_value: u32,
    bit_depth: u32,
    pixels: PixelBuffer,
}

impl Image {
    /// デコード結果から画像を作成
    pub fn from_decoded(path: impl Into<PathBuf>, decoded: DecodedImage) -> Self {
        let max_value = decoded.max_value.max(1);
        let bit_depth = (max_value as f64).log2().round() as u32;

        Self {
            path: path.into(),
            width: decoded.width,
            height: decoded.height,
            max_value,
            bit_depth,
            pixels: decoded.pixels,
        }
    }

    /// 読み込み元のパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 幅
    pub fn width(&self) -> u32 {
        self.width
    }

    /// 高さ
    pub fn height(&self) -> u32 {
        self.height
    }

    /// 1サンプルあたりのバイト数（1 または 2）
    pub fn bytes_per_sample(&self) -> u8 {
        self.pixels.bytes_per_sample()
    }

    /// 最大サンプル値
    pub fn max_value(&self) -> u32 {
        self.max_value
    }

    /// 有効ビット数
    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    /// 画素バッファ
    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    /// 画素の生サンプル値 (R, G, B)
    ///
    /// 範囲チェックは呼び出し側の責任です。
    #[inline]
    pub fn rgb(&self, row: usize, col: usize) -> [u32; 3] {
        let idx = 3 * (self.width as usize * row + col);
        [
            self.pixels.sample(idx),
            self.pixels.sample(idx + 1),
            self.pixels.sample(idx + 2),
        ]
    }
}

/// 検索結果
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// デコード中
    InProgress,
    /// 利用可能
    Ready(Arc<Image>),
    /// デコード失敗
    Failed(String),
}

impl CacheEntry {
    /// 状態を取得
    pub fn state(&self) -> ImageState {
        match self {
            CacheEntry::InProgress => ImageState::InProgress,
            CacheEntry::Ready(_) => ImageState::Ready,
            CacheEntry::Failed(_) => ImageState::Error,
        }
    }
}

/// スロット
struct Slot {
    path: PathBuf,
    /// 上書きを検出するための世代番号
    generation: u64,
    entry: CacheEntry,
}

/// スロット表
struct SlotTable {
    slots: Vec<Option<Slot>>,
    /// 次に上書きするスロット
    cursor: usize,
    next_generation: u64,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            cursor: 0,
            next_generation: 1,
        }
    }

    fn find(&self, path: &Path) -> Option<&Slot> {
        self.slots.iter().flatten().find(|slot| slot.path == path)
    }

    fn find_generation_mut(&mut self, generation: u64) -> Option<&mut Slot> {
        self.slots.iter_mut().flatten().find(|slot| slot.generation == generation)
    }

    /// 巡回位置のスロットを上書きして新しい世代番号を返す
    fn insert(&mut self, path: &Path) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let index = self.cursor;
        if let Some(evicted) = &self.slots[index] {
            debug!("キャッシュから追い出します: {}", evicted.path.display());
        }
        self.slots[index] = Some(Slot {
            path: path.to_path_buf(),
            generation,
            entry: CacheEntry::InProgress,
        });
        self.cursor = (self.cursor + 1) % self.slots.len();

        generation
    }
}

/// 画像キャッシュ
pub struct ImageCache {
    /// スロット表（デコード中は保持しない）
    table: Mutex<SlotTable>,
    /// スロットの状態が変わったときに通知される
    changed: Condvar,
    /// デコーダ
    decoder: Arc<dyn ImageDecoder>,
    capacity: usize,
}

impl ImageCache {
    /// 新しいキャッシュを作成
    pub fn new(capacity: usize, decoder: Arc<dyn ImageDecoder>) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::InvalidCapacity(capacity));
        }

        Ok(Self {
            table: Mutex::new(SlotTable::new(capacity)),
            changed: Condvar::new(),
            decoder,
            capacity,
        })
    }

    /// スロット数
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// パスを検索
    pub fn lookup(&self, path: &Path) -> Option<CacheEntry> {
        self.table.lock().find(path).map(|slot| slot.entry.clone())
    }

    /// パスがいずれかのスロットに存在するか
    pub fn contains(&self, path: &Path) -> bool {
        self.table.lock().find(path).is_some()
    }

    /// 保持しているパスの一覧（スロット順）
    pub fn resident_paths(&self) -> Vec<PathBuf> {
        self.table
            .lock()
            .slots
            .iter()
            .flatten()
            .map(|slot| slot.path.clone())
            .collect()
    }

    /// 画像を取得し、なければデコードする
    ///
    /// 他のスレッドが同じパスをデコード中なら完了を待ちます。待機中にスロットが
    /// 上書きされた場合は最初からやり直します。
    pub fn ensure(&self, path: &Path) -> Result<Arc<Image>, CacheError> {
        let generation = {
            let mut table = self.table.lock();
            loop {
                let entry = table.find(path).map(|slot| slot.entry.clone());
                match entry {
                    Some(CacheEntry::Ready(image)) => return Ok(image),
                    Some(CacheEntry::Failed(reason)) => {
                        return Err(CacheError::DecodeFailed {
                            path: path.to_path_buf(),
                            reason,
                        })
                    },
                    Some(CacheEntry::InProgress) => {
                        trace!("デコード完了を待機します: {}", path.display());
                        self.changed.wait(&mut table);
                    },
                    None => break,
                }
            }

            let generation = table.insert(path);
            // 上書きされたスロットを待っていた呼び出し元を起こす
            self.changed.notify_all();
            generation
        };

        let outcome = self
            .decoder
            .decode(path)
            .map(|decoded| Arc::new(Image::from_decoded(path, decoded)))
            .map_err(|e| e.to_string());

        {
            let mut table = self.table.lock();
            match table.find_generation_mut(generation) {
                Some(slot) => {
                    slot.entry = match &outcome {
                        Ok(image) => CacheEntry::Ready(Arc::clone(image)),
                        Err(reason) => CacheEntry::Failed(reason.clone()),
                    };
                },
                None => debug!("デコード中にスロットが上書きされました: {}", path.display()),
            }
        }
        self.changed.notify_all();

        match &outcome {
            Ok(image) => info!("画像を読み込みました: {} ({}x{}, {}ビット)", path.display(), image.width(), image.height(), image.bit_depth()),
            Err(reason) => debug!("画像の読み込みに失敗しました: {}: {}", path.display(), reason),
        }

        outcome.map_err(|reason| CacheError::DecodeFailed {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// すべてのスロットを解放
    pub fn clear(&self) {
        let mut table = self.table.lock();
        for slot in table.slots.iter_mut() {
            *slot = None;
        }
        table.cursor = 0;
        drop(table);
        self.changed.notify_all();
    }
}
