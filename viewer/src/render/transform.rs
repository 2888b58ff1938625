//! 座標変換と画素サンプリング
//!
//! 出力画素 (行 i, 列 j) をソース座標に写像します。
//!
//! ```text
//! x = dx + xoffset*z + j*z*cos(a) - i*z*sin(a)
//! y = dy + yoffset*z + j*z*sin(a) + i*z*cos(a)
//! ```
//!
//! サンプリング後に明るさ・コントラスト・ガンマ・反転を適用します。

use crate::cache::Image;
use crate::render::BYTES_PER_PIXEL;
use crate::view::{DisplayAdjust, ViewSnapshot};

/// 画像の外側の色
pub const OUTSIDE_COLOR: [u8; 3] = [0, 0, 0];

/// 明るさ・コントラスト・ガンマの変換
///
/// ガンマ表はガンマが変わったときだけ再計算します。
#[derive(Debug, Clone)]
pub struct Radiometry {
    gamma: f32,
    table: [i32; 256],
}

impl Radiometry {
    /// ガンマ 1.0 の変換を作成
    pub fn new() -> Self {
        let mut radiometry = Self {
            gamma: 1.0,
            table: [0; 256],
        };
        radiometry.rebuild();
        radiometry
    }

    /// 現在のガンマ
    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    /// ガンマを更新
    ///
    /// 表を再計算した場合は `true` を返します。
    pub fn update(&mut self, gamma: f32) -> bool {
        if gamma == self.gamma {
            return false;
        }
        self.gamma = gamma;
        self.rebuild();
        true
    }

    fn rebuild(&mut self) {
        let g = self.gamma as f64;
        for (i, entry) in self.table.iter_mut().enumerate() {
            *entry = (255.0 * (i as f64 / 255.0).powf(g)).round() as i32;
        }
    }

    /// 1チャンネル分の生サンプル値を 8 ビットに変換
    #[inline]
    pub fn apply(&self, raw: u32, bit_depth: u32, eight_bit: bool, adjust: &DisplayAdjust) -> u8 {
        let contrast = adjust.contrast as i64;
        let mut value = if self.gamma == 1.0 {
            (raw as i64 * contrast) >> bit_depth
        } else {
            let v8 = if eight_bit {
                raw as usize
            } else {
                ((raw as u64 * 255) >> bit_depth) as usize
            };
            (contrast * self.table[v8.min(255)] as i64) >> 8
        };

        value += adjust.luminosity as i64;
        let value = value.clamp(0, 255) as u8;
        if adjust.invert {
            255 - value
        } else {
            value
        }
    }
}

impl Default for Radiometry {
    fn default() -> Self {
        Self::new()
    }
}

/// 変換エンジン
///
/// 1回の描画の間だけ有効で、スナップショットと画像を借用します。
pub struct TransformEngine<'a> {
    image: &'a Image,
    adjust: DisplayAdjust,
    radiometry: &'a Radiometry,
    panorama: bool,
    nearest: bool,
    origin: (f64, f64),
    /// (z*cos(a), z*sin(a))
    step: (f64, f64),
}

impl<'a> TransformEngine<'a> {
    /// スナップショットから作成
    ///
    /// 画像がなければ `None` を返します。
    pub fn new(snapshot: &'a ViewSnapshot, radiometry: &'a Radiometry) -> Option<Self> {
        let image = snapshot.image.as_deref()?;
        let z = snapshot.z;
        let nearest = !snapshot.adjust.bilinear || (z >= 1.0 && snapshot.a == 0.0);

        Some(Self {
            image,
            adjust: snapshot.adjust,
            radiometry,
            panorama: snapshot.panorama,
            nearest,
            origin: (
                snapshot.dx + snapshot.viewport.x_offset as f64 * z,
                snapshot.dy + snapshot.viewport.y_offset as f64 * z,
            ),
            step: (z * snapshot.a.cos(), z * snapshot.a.sin()),
        })
    }

    /// 最近傍サンプリングを使うか
    pub fn is_nearest(&self) -> bool {
        self.nearest
    }

    /// 出力画素に対応するソース座標
    #[inline]
    pub fn source_coords(&self, row: usize, col: usize) -> (f64, f64) {
        let (i, j) = (row as f64, col as f64);
        let (zc, zs) = self.step;
        (self.origin.0 + j * zc - i * zs, self.origin.1 + j * zs + i * zc)
    }

    /// 水平座標を折り返す
    #[inline]
    fn wrap_x(&self, x: f64) -> f64 {
        let width = self.image.width() as f64;
        if self.panorama && width > 0.0 && (x < 0.0 || x >= width) {
            x.rem_euclid(width)
        } else {
            x
        }
    }

    /// ソース座標の生サンプル値（画像外は `None`）
    #[inline]
    pub fn sample(&self, x: f64, y: f64) -> Option<[u32; 3]> {
        if self.nearest {
            self.sample_nearest(x, y)
        } else {
            self.sample_bilinear(x, y)
        }
    }

    /// 最近傍サンプリング
    pub fn sample_nearest(&self, x: f64, y: f64) -> Option<[u32; 3]> {
        let x = self.wrap_x(x);
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let (col, row) = (x as usize, y as usize);
        if col >= self.image.width() as usize || row >= self.image.height() as usize {
            return None;
        }
        Some(self.image.rgb(row, col))
    }

    /// 整数座標の画素（画像外は `None`、パノラマでは水平に折り返す）
    #[inline]
    fn texel(&self, row: i64, col: i64) -> Option<[u32; 3]> {
        let (width, height) = (self.image.width() as i64, self.image.height() as i64);
        let col = if self.panorama && width > 0 { col.rem_euclid(width) } else { col };
        if col < 0 || row < 0 || col >= width || row >= height {
            return None;
        }
        Some(self.image.rgb(row as usize, col as usize))
    }

    /// バイリニアサンプリング
    ///
    /// 4つの隣接画素をそれぞれ取得し、画像外の隣接画素は黒として混ぜます。
    /// 4つとも画像外なら `None` を返します。
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<[u32; 3]> {
        let (fx, fy) = (x.floor(), y.floor());
        let (col, row) = (fx as i64, fy as i64);
        let (u, v) = (x - fx, y - fy);

        let neighbors = [
            (self.texel(row, col), (1.0 - u) * (1.0 - v)),
            (self.texel(row, col + 1), u * (1.0 - v)),
            (self.texel(row + 1, col), (1.0 - u) * v),
            (self.texel(row + 1, col + 1), u * v),
        ];
        if neighbors.iter().all(|(texel, _)| texel.is_none()) {
            return None;
        }

        let mut out = [0.0f64; 3];
        for (texel, weight) in neighbors {
            if let Some(rgb) = texel {
                for c in 0..3 {
                    out[c] += rgb[c] as f64 * weight;
                }
            }
        }
        Some(out.map(|value| value.round() as u32))
    }

    /// 出力画素の色
    #[inline]
    pub fn pixel(&self, row: usize, col: usize) -> [u8; 3] {
        let (x, y) = self.source_coords(row, col);
        match self.sample(x, y) {
            Some(raw) => {
                let depth = self.image.bit_depth();
                let eight_bit = self.image.bytes_per_sample() == 1;
                [
                    self.radiometry.apply(raw[0], depth, eight_bit, &self.adjust),
                    self.radiometry.apply(raw[1], depth, eight_bit, &self.adjust),
                    self.radiometry.apply(raw[2], depth, eight_bit, &self.adjust),
                ]
            },
            None => OUTSIDE_COLOR,
        }
    }

    /// 連続する行を埋める
    ///
    /// `rows` は `first_row` から始まる行の RGBA データです。
    pub fn fill_rows(&self, first_row: usize, width: usize, rows: &mut [u8]) {
        let stride = width * BYTES_PER_PIXEL;
        if stride == 0 {
            return;
        }
        for (offset, line) in rows.chunks_exact_mut(stride).enumerate() {
            let row = first_row + offset;
            for (col, out) in line.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                let [r, g, b] = self.pixel(row, col);
                out.copy_from_slice(&[r, g, b, 255]);
            }
        }
    }
}
