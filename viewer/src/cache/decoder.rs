//! 画像デコードモジュール
//!
//! ファイルから画像を読み込み、3チャンネル・行優先の画素バッファに正規化します。
//! PPM → JPEG → TIFF の順に試し、すべて失敗した場合は外部変換
//! （ImageMagick の `convert`）で PPM に変換してから読み込みます。
//! EXIF の向きタグがあれば正規化の前に回転します。

use image::{DynamicImage, ImageFormat};
use log::{debug, trace};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// デコードエラー
#[derive(Error, Debug)]
pub enum DecodeError {
    /// ファイルが存在しない
    #[error("ファイルが存在しません: {}", .0.display())]
    NotFound(PathBuf),

    /// I/Oエラー
    #[error("I/Oエラー: {0}")]
    IoError(#[from] io::Error),

    /// 画像ライブラリのエラー
    #[error("画像のデコードに失敗しました: {0}")]
    DecodeFailure(#[from] image::ImageError),

    /// 外部変換の失敗
    #[error("外部変換に失敗しました: {0}")]
    ConversionFailed(String),

    /// どの形式でも読めなかった
    #[error("対応していない画像形式です: {}", .0.display())]
    Unsupported(PathBuf),
}

/// 画素バッファ
///
/// 常に RGB の3チャンネル、行優先で格納されます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelBuffer {
    /// 1サンプル1バイト
    Eight(Vec<u8>),
    /// 1サンプル2バイト
    Sixteen(Vec<u16>),
}

impl PixelBuffer {
    /// 1サンプルあたりのバイト数
    pub fn bytes_per_sample(&self) -> u8 {
        match self {
            PixelBuffer::Eight(_) => 1,
            PixelBuffer::Sixteen(_) => 2,
        }
    }

    /// サンプル数
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::Eight(data) => data.len(),
            PixelBuffer::Sixteen(data) => data.len(),
        }
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 指定位置のサンプル値
    #[inline]
    pub fn sample(&self, index: usize) -> u32 {
        match self {
            PixelBuffer::Eight(data) => data[index] as u32,
            PixelBuffer::Sixteen(data) => data[index] as u32,
        }
    }
}

/// デコード結果
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// 画素データ
    pub pixels: PixelBuffer,
    /// 幅
    pub width: u32,
    /// 高さ
    pub height: u32,
    /// 最大サンプル値
    pub max_value: u32,
}

impl DecodedImage {
    /// 8ビットの RGB バッファから作成
    pub fn rgb8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            pixels: PixelBuffer::Eight(data),
            width,
            height,
            max_value: 255,
        }
    }

    /// 16ビットの RGB バッファから作成
    pub fn rgb16(width: u32, height: u32, data: Vec<u16>, max_value: u32) -> Self {
        Self {
            pixels: PixelBuffer::Sixteen(data),
            width,
            height,
            max_value,
        }
    }

    /// 画像ライブラリの画像から変換
    ///
    /// 16ビット画像の最大値はバッファから実測します（12/14ビットしか使わないカメラ向け）。
    pub fn from_dynamic(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        let color = image.color();
        let wide = color.bytes_per_pixel() / color.channel_count() > 1;

        if wide {
            let data = image.to_rgb16().into_raw();
            let max_value = data.iter().copied().max().unwrap_or(0).max(255) as u32;
            Self::rgb16(width, height, data, max_value)
        } else {
            Self::rgb8(width, height, image.to_rgb8().into_raw())
        }
    }
}

/// 画像デコーダ
///
/// キャッシュはこのトレイト越しにデコードを依頼します。
pub trait ImageDecoder: Send + Sync {
    /// ファイルをデコード
    fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError>;
}

/// 試行するネイティブ形式（この順で試す）
pub const FALLBACK_ORDER: [ImageFormat; 3] = [ImageFormat::Pnm, ImageFormat::Jpeg, ImageFormat::Tiff];

/// 指定形式でファイルを読み込む
fn load_file(path: &Path, format: ImageFormat) -> Result<DynamicImage, DecodeError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(image::load(reader, format)?)
}

/// 指定形式でファイルをデコード
pub fn decode_file(path: &Path, format: ImageFormat) -> Result<DecodedImage, DecodeError> {
    load_file(path, format).map(DecodedImage::from_dynamic)
}

/// EXIF の向き（回転のみ扱い、反転は無視）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// 回転なし
    Normal,
    /// 時計回りに90度
    Rotate90,
    /// 180度
    Rotate180,
    /// 時計回りに270度
    Rotate270,
}

impl Orientation {
    /// EXIF の Orientation タグ値から変換
    pub fn from_exif(value: u32) -> Self {
        match value {
            3 | 4 => Orientation::Rotate180,
            5 | 6 => Orientation::Rotate90,
            7 | 8 => Orientation::Rotate270,
            _ => Orientation::Normal,
        }
    }

    /// ファイルの EXIF から向きを読む
    ///
    /// EXIF がない・読めない場合は `Normal` です。
    pub fn read(path: &Path) -> Self {
        let Ok(file) = File::open(path) else {
            return Orientation::Normal;
        };
        let mut reader = BufReader::new(file);
        let Ok(exif) = exif::Reader::new().read_from_container(&mut reader) else {
            return Orientation::Normal;
        };

        exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .map(Self::from_exif)
            .unwrap_or(Orientation::Normal)
    }

    /// 画像を回転
    pub fn apply(self, image: DynamicImage) -> DynamicImage {
        match self {
            Orientation::Normal => image,
            Orientation::Rotate90 => image.rotate90(),
            Orientation::Rotate180 => image.rotate180(),
            Orientation::Rotate270 => image.rotate270(),
        }
    }
}

/// 外部変換コマンド
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    /// 実行するプログラム
    program: String,
    /// 一時ファイルを置くディレクトリ
    temp_dir: PathBuf,
}

impl ExternalConverter {
    /// ImageMagick の `convert` を使う変換器を作成
    pub fn imagemagick() -> Self {
        let temp_dir = std::env::var_os("TMP")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Self {
            program: "convert".to_string(),
            temp_dir,
        }
    }

    /// プログラム名を変更
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// PPM に変換してから読み込む
    pub fn convert(&self, path: &Path) -> Result<DynamicImage, DecodeError> {
        // 変換結果の一時ファイルはドロップ時に削除される
        let target = tempfile::Builder::new()
            .prefix("pano-view-")
            .suffix(".ppm")
            .tempfile_in(&self.temp_dir)?;

        debug!("外部変換を実行します: {} {}", self.program, path.display());

        let status = Command::new(&self.program)
            .arg(path)
            .arg("-quiet")
            .arg(target.path())
            .stdin(Stdio::null())
            .status()
            .map_err(|e| DecodeError::ConversionFailed(format!("{} を起動できません: {}", self.program, e)))?;

        if !status.success() {
            return Err(DecodeError::ConversionFailed(format!("{} が失敗しました: {}", self.program, status)));
        }

        load_file(target.path(), ImageFormat::Pnm)
    }
}

/// フォールバック付きデコーダ
#[derive(Debug, Clone)]
pub struct FallbackDecoder {
    /// 外部変換（無効にもできる）
    converter: Option<ExternalConverter>,
    /// EXIF の向きに従って回転する
    autorotate: bool,
}

impl FallbackDecoder {
    /// 外部変換付きのデコーダを作成
    pub fn new() -> Self {
        Self {
            converter: Some(ExternalConverter::imagemagick()),
            autorotate: true,
        }
    }

    /// ネイティブ形式のみを扱うデコーダを作成
    pub fn without_converter() -> Self {
        Self {
            converter: None,
            autorotate: true,
        }
    }

    /// 外部変換器を差し替え
    pub fn with_converter(converter: ExternalConverter) -> Self {
        Self {
            converter: Some(converter),
            autorotate: true,
        }
    }

    /// 自動回転の有効・無効を設定
    pub fn with_autorotate(mut self, autorotate: bool) -> Self {
        self.autorotate = autorotate;
        self
    }

    fn load(&self, path: &Path) -> Result<DynamicImage, DecodeError> {
        for format in FALLBACK_ORDER {
            match load_file(path, format) {
                Ok(image) => {
                    debug!("{:?} として読み込みました: {} ({}x{})", format, path.display(), image.width(), image.height());
                    return Ok(image);
                },
                Err(e) => trace!("{:?} として読み込めません: {}: {}", format, path.display(), e),
            }
        }

        match &self.converter {
            Some(converter) => converter.convert(path),
            None => Err(DecodeError::Unsupported(path.to_path_buf())),
        }
    }
}

impl Default for FallbackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageDecoder for FallbackDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
        if !path.is_file() {
            return Err(DecodeError::NotFound(path.to_path_buf()));
        }

        let mut image = self.load(path)?;
        if self.autorotate {
            let orientation = Orientation::read(path);
            if orientation != Orientation::Normal {
                debug!("EXIF の向きに従って回転します: {} ({:?})", path.display(), orientation);
                image = orientation.apply(image);
            }
        }
        Ok(DecodedImage::from_dynamic(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_decode_ppm_8bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = b"P6\n2 1\n255\n".to_vec();
        bytes.extend_from_slice(&[10, 20, 30, 200, 100, 50]);
        let path = write_file(dir.path(), "small.ppm", &bytes);

        let image = FallbackDecoder::without_converter().decode(&path).unwrap();

        assert_eq!((image.width, image.height), (2, 1));
        assert_eq!(image.max_value, 255);
        assert_eq!(image.pixels, PixelBuffer::Eight(vec![10, 20, 30, 200, 100, 50]));
    }

    #[test]
    fn test_decode_ppm_16bit_measures_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = b"P6\n1 1\n65535\n".to_vec();
        // 12ビットしか使っていない画素（ビッグエンディアン）
        for sample in [4095u16, 1000, 0] {
            bytes.extend_from_slice(&sample.to_be_bytes());
        }
        let path = write_file(dir.path(), "deep.ppm", &bytes);

        let image = FallbackDecoder::without_converter().decode(&path).unwrap();

        assert_eq!(image.pixels.bytes_per_sample(), 2);
        assert_eq!(image.max_value, 4095);
        assert_eq!(image.pixels.sample(0), 4095);
    }

    /// 向きタグだけを持つ EXIF (APP1) を SOI の直後に挿入した JPEG
    fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
        let pixels = vec![128u8; (width * height * 3) as usize];
        let mut encoded = Vec::new();
        image::codecs::jpeg::JpegEncoder::new(&mut encoded)
            .encode(&pixels, width, height, image::ColorType::Rgb8)
            .unwrap();

        let mut payload = b"Exif\0\0".to_vec();
        // リトルエンディアンの TIFF ヘッダと、エントリ1つの IFD0
        payload.extend_from_slice(&[0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&0x0112u16.to_le_bytes());
        payload.extend_from_slice(&3u16.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&orientation.to_le_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&0u32.to_le_bytes());

        let mut bytes = encoded[..2].to_vec();
        bytes.extend_from_slice(&[0xFF, 0xE1]);
        bytes.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&encoded[2..]);
        bytes
    }

    #[test]
    fn test_exif_orientation_rotates_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "portrait.jpg", &jpeg_with_orientation(16, 8, 6));

        assert_eq!(Orientation::read(&path), Orientation::Rotate90);
        let image = FallbackDecoder::without_converter().decode(&path).unwrap();
        assert_eq!((image.width, image.height), (8, 16));

        let image = FallbackDecoder::without_converter().with_autorotate(false).decode(&path).unwrap();
        assert_eq!((image.width, image.height), (16, 8));
    }

    #[test]
    fn test_orientation_without_exif_is_normal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "plain.ppm", b"P6\n1 1\n255\n\x01\x02\x03");

        assert_eq!(Orientation::read(&path), Orientation::Normal);
        assert_eq!(Orientation::from_exif(3), Orientation::Rotate180);
        assert_eq!(Orientation::from_exif(8), Orientation::Rotate270);
        assert_eq!(Orientation::from_exif(1), Orientation::Normal);
    }

    #[test]
    fn test_decode_missing_file() {
        let result = FallbackDecoder::without_converter().decode(Path::new("/nonexistent/pano.ppm"));
        assert!(matches!(result, Err(DecodeError::NotFound(_))));
    }

    #[test]
    fn test_decode_garbage_without_converter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "notes.txt", b"this is not an image");

        let result = FallbackDecoder::without_converter().decode(&path);
        assert!(matches!(result, Err(DecodeError::Unsupported(_))));
    }

    #[test]
    fn test_failing_converter_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "notes.txt", b"this is not an image");
        let converter = ExternalConverter::imagemagick().with_program("/nonexistent/convert");

        let result = FallbackDecoder::with_converter(converter).decode(&path);
        assert!(matches!(result, Err(DecodeError::ConversionFailed(_))));
    }
}
