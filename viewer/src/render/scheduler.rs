//! 帯分割による並列描画
//!
//! 出力の行を連続した帯に分け、帯ごとに1スレッドで変換エンジンを実行します。
//! スレッドは描画のたびに生成され、表示前にすべて合流します。

use crate::render::transform::{Radiometry, TransformEngine};
use crate::render::FrameBuffer;
use crate::view::ViewSnapshot;
use log::debug;
use std::ops::Range;
use std::thread;
use sysinfo::{System, SystemExt};

/// 帯スケジューラ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileScheduler {
    workers: usize,
}

impl TileScheduler {
    /// ワーカー数を指定して作成（最低1）
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// CPUコア数からワーカー数を決める
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        let cores = system.cpus().len();
        debug!("検出したCPUコア数: {}", cores);
        Self::new(cores)
    }

    /// ワーカー数
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 行を帯に分割
    ///
    /// 最後の帯が端数の行を引き受けます。
    pub fn bands(&self, height: usize) -> Vec<Range<usize>> {
        let count = self.workers.min(height).max(1);
        let band = height / count;
        (0..count)
            .map(|i| {
                let start = i * band;
                let end = if i + 1 == count { height } else { start + band };
                start..end
            })
            .collect()
    }

    /// フレームを埋める
    ///
    /// 画像がなければ黒で塗りつぶします。
    pub fn fill(&self, frame: &mut FrameBuffer, snapshot: &ViewSnapshot, radiometry: &Radiometry) {
        let engine = match TransformEngine::new(snapshot, radiometry) {
            Some(engine) => engine,
            None => {
                frame.clear();
                return;
            },
        };

        let width = frame.width() as usize;
        let stride = frame.stride();
        let bands = self.bands(frame.height() as usize);

        if bands.len() == 1 {
            engine.fill_rows(0, width, frame.data_mut());
            return;
        }

        let engine = &engine;
        thread::scope(|scope| {
            let mut rest = frame.data_mut();
            for band in bands {
                let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(band.len() * stride);
                rest = tail;
                scope.spawn(move || engine.fill_rows(band.start, width, chunk));
            }
        });
    }
}

impl Default for TileScheduler {
    fn default() -> Self {
        Self::detect()
    }
}
