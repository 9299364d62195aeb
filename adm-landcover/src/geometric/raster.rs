use anyhow::{Context, Result};
use geo::Rect;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::{debug, info};

use crate::geo_core::BoundingBox;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GT_RASTER_TYPE_KEY: u16 = 1025;
const RASTER_PIXEL_IS_POINT: u16 = 2;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const USER_DEFINED: u16 = 32767;

/// One input raster of the zonal fold
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSource {
    /// Column prefix of its statistics, e.g. `esa_lc_2020`
    pub id: String,
    pub year: i32,
    pub path: PathBuf,
}

/// North-up affine transform, GDAL order without the rotation terms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    /// Negative for north-up rasters
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Self {
        GeoTransform {
            origin_x,
            pixel_width,
            origin_y,
            pixel_height,
        }
    }

    /// From a GDAL `[x0, dx, rx, y0, ry, dy]` array; rotated rasters are refused
    pub fn from_gdal(gt: [f64; 6]) -> Result<Self> {
        anyhow::ensure!(
            gt[2] == 0.0 && gt[4] == 0.0,
            "Rotated geotransforms are not supported: {:?}",
            gt
        );
        Ok(GeoTransform::new(gt[0], gt[1], gt[3], gt[5]))
    }

    /// Footprint of the pixel at `(row, col)`
    pub fn pixel_rect(&self, row: usize, col: usize) -> Rect<f64> {
        let x0 = self.origin_x + col as f64 * self.pixel_width;
        let y0 = self.origin_y + row as f64 * self.pixel_height;
        Rect::new(
            (x0, y0),
            (x0 + self.pixel_width, y0 + self.pixel_height),
        )
    }

    /// Pixel rows and columns whose footprint may touch `bbox`, clamped to
    /// `width x height`. Returns `(row_start, row_end, col_start, col_end)`,
    /// end exclusive.
    pub fn pixel_window(
        &self,
        bbox: &BoundingBox,
        width: usize,
        height: usize,
    ) -> (usize, usize, usize, usize) {
        let dx = self.pixel_width;
        let dy = self.pixel_height.abs();

        // One extra pixel on each side so boundary-touching pixels are kept
        let col_start = ((bbox.min_x - self.origin_x) / dx).floor() - 1.0;
        let col_end = ((bbox.max_x - self.origin_x) / dx).ceil() + 1.0;
        let row_start = ((self.origin_y - bbox.max_y) / dy).floor() - 1.0;
        let row_end = ((self.origin_y - bbox.min_y) / dy).ceil() + 1.0;

        let clamp = |v: f64, max: usize| v.max(0.0).min(max as f64) as usize;
        (
            clamp(row_start, height),
            clamp(row_end, height),
            clamp(col_start, width),
            clamp(col_end, width),
        )
    }

    /// Transform of the sub-window starting at `(row, col)`
    pub fn offset(&self, row: usize, col: usize) -> Self {
        GeoTransform::new(
            self.origin_x + col as f64 * self.pixel_width,
            self.pixel_width,
            self.origin_y + row as f64 * self.pixel_height,
            self.pixel_height,
        )
    }
}

/// Single band of categorical codes, usually a window of a larger file
#[derive(Debug, Clone)]
pub struct CategoricalRaster {
    source: RasterSource,
    transform: GeoTransform,
    width: usize,
    height: usize,
    data: Vec<i64>,
    nodata: Option<i64>,
    epsg: Option<u32>,
}

impl CategoricalRaster {
    pub fn new(
        source: RasterSource,
        transform: GeoTransform,
        width: usize,
        height: usize,
        data: Vec<i64>,
        nodata: Option<i64>,
        epsg: Option<u32>,
    ) -> Result<Self> {
        anyhow::ensure!(
            data.len() == width * height,
            "Raster `{}`: {} values for a {}x{} grid",
            source.id,
            data.len(),
            width,
            height
        );
        anyhow::ensure!(
            transform.pixel_width > 0.0 && transform.pixel_height < 0.0,
            "Raster `{}` is not north-up: {:?}",
            source.id,
            transform
        );
        Ok(CategoricalRaster {
            source,
            transform,
            width,
            height,
            data,
            nodata,
            epsg,
        })
    }

    /// Read the part of a GeoTIFF covering `bbox`
    ///
    /// Only the strips or tiles overlapping the window are decoded.
    pub fn open_window(source: &RasterSource, bbox: &BoundingBox) -> Result<Self> {
        let path = source.path.as_path();
        let file = File::open(path)
            .with_context(|| format!("Failed to open raster: {}", path.display()))?;
        let mut decoder = Decoder::new(BufReader::new(file))
            .with_context(|| format!("Failed to read TIFF header: {}", path.display()))?
            .with_limits(Limits::unlimited());

        match decoder.colortype()? {
            ColorType::Gray(_) => {}
            other => anyhow::bail!(
                "Raster {} must be single band, found {:?}",
                path.display(),
                other
            ),
        }

        let (full_width, full_height) = decoder.dimensions()?;
        let (full_width, full_height) = (full_width as usize, full_height as usize);
        let geo_keys = read_geo_keys(&mut decoder)?;
        let full_transform = read_transform(&mut decoder, &geo_keys)
            .with_context(|| format!("No usable georeferencing in {}", path.display()))?;
        let nodata = read_nodata(&mut decoder)?;
        let epsg = epsg_from_geo_keys(&geo_keys);

        let (row0, row1, col0, col1) = full_transform.pixel_window(bbox, full_width, full_height);
        let width = col1 - col0;
        let height = row1 - row0;
        let mut data = vec![nodata.unwrap_or(0); width * height];

        if width > 0 && height > 0 {
            let (chunk_w, chunk_h) = decoder.chunk_dimensions();
            let (chunk_w, chunk_h) = (chunk_w as usize, chunk_h as usize);
            let chunks_across = full_width.div_ceil(chunk_w);

            for cy in row0 / chunk_h..=(row1 - 1) / chunk_h {
                for cx in col0 / chunk_w..=(col1 - 1) / chunk_w {
                    let index = cy * chunks_across + cx;
                    let chunk = decoder
                        .read_chunk(index as u32)
                        .with_context(|| format!("Failed to decode chunk {} of {}", index, path.display()))?;
                    let values = decoding_result_to_i64(chunk)?;

                    // Edge chunks may come back cropped to the image
                    let data_w = chunk_w.min(full_width - cx * chunk_w);
                    let data_h = chunk_h.min(full_height - cy * chunk_h);
                    let stride = if values.len() == chunk_w * chunk_h {
                        chunk_w
                    } else {
                        data_w
                    };

                    let r_start = row0.max(cy * chunk_h);
                    let r_end = row1.min(cy * chunk_h + data_h);
                    let c_start = col0.max(cx * chunk_w);
                    let c_end = col1.min(cx * chunk_w + data_w);
                    for r in r_start..r_end {
                        let src = (r - cy * chunk_h) * stride + (c_start - cx * chunk_w);
                        let dst = (r - row0) * width + (c_start - col0);
                        let n = c_end - c_start;
                        data[dst..dst + n].copy_from_slice(&values[src..src + n]);
                    }
                }
            }
        }

        info!(
            raster = %source.id,
            path = %path.display(),
            width,
            height,
            ?epsg,
            ?nodata,
            "read raster window"
        );

        CategoricalRaster::new(
            source.clone(),
            full_transform.offset(row0, col0),
            width,
            height,
            data,
            nodata,
            epsg,
        )
    }

    pub fn source(&self) -> &RasterSource {
        &self.source
    }

    pub fn id(&self) -> &str {
        &self.source.id
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn nodata(&self) -> Option<i64> {
        self.nodata
    }

    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    pub fn get(&self, row: usize, col: usize) -> Option<i64> {
        if row < self.height && col < self.width {
            Some(self.data[row * self.width + col])
        } else {
            None
        }
    }

    pub fn is_nodata(&self, value: i64) -> bool {
        self.nodata == Some(value)
    }

    pub fn bounds(&self) -> BoundingBox {
        let t = &self.transform;
        let x1 = t.origin_x + self.width as f64 * t.pixel_width;
        let y1 = t.origin_y + self.height as f64 * t.pixel_height;
        BoundingBox::new(
            t.origin_x.min(x1),
            t.origin_y.min(y1),
            t.origin_x.max(x1),
            t.origin_y.max(y1),
        )
    }
}

fn decoding_result_to_i64(result: DecodingResult) -> Result<Vec<i64>> {
    let values = match result {
        DecodingResult::U8(v) => v.into_iter().map(i64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(i64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(i64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(i64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(i64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(i64::from).collect(),
        DecodingResult::I64(v) => v,
        other => anyhow::bail!("Unsupported sample type for a categorical raster: {:?}", sample_kind(&other)),
    };
    Ok(values)
}

fn sample_kind(result: &DecodingResult) -> &'static str {
    match result {
        DecodingResult::U64(_) => "u64",
        DecodingResult::F32(_) => "f32",
        DecodingResult::F64(_) => "f64",
        _ => "integer",
    }
}

/// Raw GeoKey directory, empty when the file carries none
fn read_geo_keys<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Result<Vec<u16>> {
    let tag = Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY);
    match decoder.find_tag(tag)? {
        Some(value) => Ok(value
            .into_u16_vec()
            .context("Malformed GeoKeyDirectory tag")?),
        None => Ok(Vec::new()),
    }
}

/// Inline SHORT value of a GeoKey
fn geo_key_value(keys: &[u16], key: u16) -> Option<u16> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    keys[4..]
        .chunks_exact(4)
        .take(count)
        .find(|entry| entry[0] == key && entry[1] == 0)
        .map(|entry| entry[3])
}

pub(crate) fn epsg_from_geo_keys(keys: &[u16]) -> Option<u32> {
    geo_key_value(keys, PROJECTED_CS_TYPE_KEY)
        .or_else(|| geo_key_value(keys, GEOGRAPHIC_TYPE_KEY))
        .filter(|&code| code != USER_DEFINED && code != 0)
        .map(u32::from)
}

fn read_transform<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    geo_keys: &[u16],
) -> Result<GeoTransform> {
    let scale = decoder.find_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))?;
    let tiepoint = decoder.find_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT))?;

    let transform = match (scale, tiepoint) {
        (Some(scale), Some(tiepoint)) => {
            let scale = scale.into_f64_vec()?;
            let tiepoint = tiepoint.into_f64_vec()?;
            transform_from_tiepoint(&scale, &tiepoint)?
        }
        _ => {
            let matrix = decoder
                .find_tag(Tag::from_u16_exhaustive(MODEL_TRANSFORMATION))?
                .context("Neither ModelPixelScale/ModelTiepoint nor ModelTransformation present")?
                .into_f64_vec()?;
            transform_from_matrix(&matrix)?
        }
    };

    Ok(apply_raster_type(transform, geo_keys))
}

/// Move a `PixelIsPoint` origin from the first pixel center to its corner
pub(crate) fn apply_raster_type(transform: GeoTransform, geo_keys: &[u16]) -> GeoTransform {
    if geo_key_value(geo_keys, GT_RASTER_TYPE_KEY) != Some(RASTER_PIXEL_IS_POINT) {
        return transform;
    }
    debug!("PixelIsPoint raster, shifting origin by half a pixel");
    GeoTransform::new(
        transform.origin_x - transform.pixel_width / 2.0,
        transform.pixel_width,
        transform.origin_y - transform.pixel_height / 2.0,
        transform.pixel_height,
    )
}

pub(crate) fn transform_from_tiepoint(scale: &[f64], tiepoint: &[f64]) -> Result<GeoTransform> {
    anyhow::ensure!(scale.len() >= 2, "ModelPixelScale needs at least 2 values");
    anyhow::ensure!(tiepoint.len() >= 6, "ModelTiepoint needs at least 6 values");
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    let (sx, sy) = (scale[0], scale[1]);
    Ok(GeoTransform::new(x - i * sx, sx, y + j * sy, -sy))
}

pub(crate) fn transform_from_matrix(m: &[f64]) -> Result<GeoTransform> {
    anyhow::ensure!(m.len() >= 16, "ModelTransformation needs 16 values");
    GeoTransform::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]])
}

fn read_nodata<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Result<Option<i64>> {
    let Some(value) = decoder.find_tag(Tag::from_u16_exhaustive(GDAL_NODATA))? else {
        return Ok(None);
    };
    let text = value.into_string()?;
    Ok(parse_nodata(&text))
}

/// GDAL stores nodata as ASCII; non-integral values cannot match a class code
pub(crate) fn parse_nodata(text: &str) -> Option<i64> {
    let value: f64 = text.trim_matches(char::from(0)).trim().parse().ok()?;
    (value.is_finite() && value.fract() == 0.0).then_some(value as i64)
}
