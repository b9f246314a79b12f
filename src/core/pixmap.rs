//! Decoded raster buffers and the stream-decode machinery behind them.
//!
//! A [`Pixmap`] is the decoded form of one image XObject: 8-bit interleaved
//! samples plus enough colorspace metadata to convert and serialize it.
//! Everything filter-specific (Flate with predictor reversal, DCT, JPX, raw)
//! happens in `from_xref`; downstream code only ever sees 8-bit Gray, RGB or
//! CMYK samples, optionally with a trailing alpha channel.

use crate::error::{ExtractError, Result};
use image::{DynamicImage, ImageBuffer, ImageFormat};
use lopdf::{Document, Object, ObjectId};
use std::io::Cursor;

// ── Colorspace ──────────────────────────────────────────────────

/// Device-level colorspace of a decoded pixmap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Colorspace {
  Gray,
  Rgb,
  Cmyk,
}

impl Colorspace {
  pub fn name(&self) -> &'static str {
    match self {
      Colorspace::Gray => "DeviceGray",
      Colorspace::Rgb => "DeviceRGB",
      Colorspace::Cmyk => "DeviceCMYK",
    }
  }

  pub fn components(&self) -> u32 {
    match self {
      Colorspace::Gray => 1,
      Colorspace::Rgb => 3,
      Colorspace::Cmyk => 4,
    }
  }

  /// Map a resolved PDF colorspace name to its device-level equivalent.
  /// Separation and DeviceN inks decode as single-channel intensities.
  /// Unknown families (Indexed, Lab, ...) return `None` and are skipped
  /// by the pipeline.
  pub fn from_pdf_name(name: &str) -> Option<Colorspace> {
    match name {
      "DeviceRGB" | "CalRGB" | "ICCBased3" => Some(Colorspace::Rgb),
      "DeviceGray" | "CalGray" | "ICCBased1" | "Separation" | "DeviceN" => Some(Colorspace::Gray),
      "DeviceCMYK" | "ICCBased4" => Some(Colorspace::Cmyk),
      _ => None,
    }
  }
}

// ── Pixmap ──────────────────────────────────────────────────────

/// Decoded 8-bit raster. `n` color components per pixel, plus one alpha
/// byte per pixel when `alpha` is set. `colorspace` is `None` for stencil
/// masks and for families the decoder does not understand.
#[derive(Clone)]
pub(crate) struct Pixmap {
  pub width: u32,
  pub height: u32,
  pub n: u32,
  pub alpha: bool,
  pub colorspace: Option<Colorspace>,
  pub samples: Vec<u8>,
}

impl Pixmap {
  /// Decode the image XObject at `xref` into 8-bit samples.
  pub fn from_xref(doc: &Document, xref: ObjectId) -> Result<Pixmap> {
    let stream = image_stream(doc, xref)?;

    let width = get_dict_int(&stream.dict, b"Width").unwrap_or(0) as u32;
    let height = get_dict_int(&stream.dict, b"Height").unwrap_or(0) as u32;
    let bpc = get_dict_int(&stream.dict, b"BitsPerComponent").unwrap_or(8) as u32;
    if width == 0 || height == 0 {
      return Err(decode_err(xref, "zero dimension"));
    }

    let is_mask = matches!(stream.dict.get(b"ImageMask"), Ok(Object::Boolean(true)));
    let cs_name = resolve_color_space(doc, &stream.dict);
    let colorspace = if is_mask {
      None
    } else {
      Colorspace::from_pdf_name(&cs_name)
    };
    let filter = resolve_filter(&stream.dict);

    match filter.as_deref() {
      Some("DCTDecode") => {
        let img = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
          .map_err(|e| decode_err(xref, &format!("jpeg: {e}")))?;
        Ok(Pixmap::from_dynamic(&img))
      }
      Some("JPXDecode") => {
        let jp2 =
          hayro_jpeg2000::Image::new(&stream.content, &hayro_jpeg2000::DecodeSettings::default())
            .map_err(|e| decode_err(xref, &format!("jpx: {e:?}")))?;
        let img = DynamicImage::from_decoder(jp2)
          .map_err(|e| decode_err(xref, &format!("jpx: {e}")))?;
        Ok(Pixmap::from_dynamic(&img))
      }
      _ => {
        // Single-channel for masks, three as a guess for unknown families;
        // a byte-count mismatch below rejects a wrong guess.
        let n = match colorspace {
          Some(cs) => cs.components(),
          None if is_mask => 1,
          None => 3,
        };
        let content = decompress_stream_content(doc, stream, width, height, n, bpc);
        let samples = normalize_to_8bit(&content, width, height, n, bpc)
          .ok_or_else(|| decode_err(xref, "sample buffer shorter than dimensions imply"))?;
        Ok(Pixmap {
          width,
          height,
          n,
          alpha: false,
          colorspace,
          samples,
        })
      }
    }
  }

  fn from_dynamic(img: &DynamicImage) -> Pixmap {
    let (width, height) = (img.width(), img.height());
    match img {
      DynamicImage::ImageLuma8(b) => Pixmap {
        width,
        height,
        n: 1,
        alpha: false,
        colorspace: Some(Colorspace::Gray),
        samples: b.as_raw().clone(),
      },
      DynamicImage::ImageLumaA8(b) => Pixmap {
        width,
        height,
        n: 1,
        alpha: true,
        colorspace: Some(Colorspace::Gray),
        samples: b.as_raw().clone(),
      },
      DynamicImage::ImageRgb8(b) => Pixmap {
        width,
        height,
        n: 3,
        alpha: false,
        colorspace: Some(Colorspace::Rgb),
        samples: b.as_raw().clone(),
      },
      DynamicImage::ImageRgba8(b) => Pixmap {
        width,
        height,
        n: 3,
        alpha: true,
        colorspace: Some(Colorspace::Rgb),
        samples: b.as_raw().clone(),
      },
      other => Pixmap {
        width,
        height,
        n: 3,
        alpha: false,
        colorspace: Some(Colorspace::Rgb),
        samples: other.to_rgb8().into_raw(),
      },
    }
  }

  fn stride(&self) -> usize {
    self.n as usize + usize::from(self.alpha)
  }

  /// Convert Gray or CMYK samples to RGB; the alpha channel, if any, is
  /// carried over unchanged. RGB pixmaps are returned as-is.
  pub fn to_rgb(&self) -> Pixmap {
    match self.colorspace {
      Some(Colorspace::Rgb) | None => self.clone(),
      Some(Colorspace::Gray) => {
        let stride = self.stride();
        let mut samples = Vec::with_capacity(self.samples.len() / stride * 4);
        for px in self.samples.chunks_exact(stride) {
          samples.extend_from_slice(&[px[0], px[0], px[0]]);
          if self.alpha {
            samples.push(px[1]);
          }
        }
        Pixmap {
          n: 3,
          colorspace: Some(Colorspace::Rgb),
          samples,
          ..*self
        }
      }
      Some(Colorspace::Cmyk) => {
        let stride = self.stride();
        let mut samples = Vec::with_capacity(self.samples.len() / stride * 3);
        for px in self.samples.chunks_exact(stride) {
          samples.extend_from_slice(&cmyk_to_rgb(px[0], px[1], px[2], px[3]));
          if self.alpha {
            samples.push(px[4]);
          }
        }
        Pixmap {
          n: 3,
          colorspace: Some(Colorspace::Rgb),
          samples,
          ..*self
        }
      }
    }
  }

  /// Attach per-pixel alpha taken from a mask raster. Masks published at a
  /// different resolution than their base are resampled nearest-neighbour.
  pub fn set_alpha(&mut self, mask: &[u8], mask_w: u32, mask_h: u32) {
    let alpha = resample_nearest(mask, mask_w, mask_h, self.width, self.height);
    let stride = self.stride();
    let mut samples = Vec::with_capacity((self.width * self.height) as usize * (self.n as usize + 1));
    for (px, a) in self.samples.chunks_exact(stride).zip(alpha.iter()) {
      samples.extend_from_slice(&px[..self.n as usize]);
      samples.push(*a);
    }
    self.samples = samples;
    self.alpha = true;
  }

  /// Invert the color channels in place; alpha is untouched.
  pub fn invert(&mut self) {
    let stride = self.stride();
    let n = self.n as usize;
    for px in self.samples.chunks_exact_mut(stride) {
      for v in &mut px[..n] {
        *v = 255 - *v;
      }
    }
  }

  pub fn to_dynamic(&self) -> Result<DynamicImage> {
    if self.colorspace == Some(Colorspace::Cmyk) {
      return self.to_rgb().to_dynamic();
    }
    let make = |w, h, data: Vec<u8>| -> Result<DynamicImage> {
      match (self.n, self.alpha) {
        (1, false) => ImageBuffer::from_raw(w, h, data)
          .map(DynamicImage::ImageLuma8)
          .ok_or_else(|| decode_err((0, 0), "gray buffer size mismatch")),
        (1, true) => ImageBuffer::from_raw(w, h, data)
          .map(DynamicImage::ImageLumaA8)
          .ok_or_else(|| decode_err((0, 0), "gray+alpha buffer size mismatch")),
        (3, false) => ImageBuffer::from_raw(w, h, data)
          .map(DynamicImage::ImageRgb8)
          .ok_or_else(|| decode_err((0, 0), "rgb buffer size mismatch")),
        (3, true) => ImageBuffer::from_raw(w, h, data)
          .map(DynamicImage::ImageRgba8)
          .ok_or_else(|| decode_err((0, 0), "rgba buffer size mismatch")),
        _ => Err(decode_err((0, 0), "unsupported component count")),
      }
    };
    make(self.width, self.height, self.samples.clone())
  }

  /// PNG-serialize the pixmap in memory. Used both for write-out and as
  /// the byte pattern the correlator probes layout blocks with.
  pub fn tobytes_png(&self) -> Result<Vec<u8>> {
    let img = self.to_dynamic()?;
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
  }
}

fn decode_err(xref: ObjectId, reason: &str) -> ExtractError {
  ExtractError::Decode {
    xref,
    reason: reason.to_string(),
  }
}

/// Fetch the stream object at `xref`, requiring an Image XObject.
pub(crate) fn image_stream(doc: &Document, xref: ObjectId) -> Result<&lopdf::Stream> {
  let stream = match doc.get_object(xref) {
    Ok(Object::Stream(s)) => s,
    _ => return Err(decode_err(xref, "not a stream object")),
  };
  let subtype = stream.dict.get(b"Subtype").ok().and_then(|v| {
    if let Object::Name(n) = v {
      Some(n.as_slice())
    } else {
      None
    }
  });
  if subtype != Some(b"Image") {
    return Err(decode_err(xref, "not an image XObject"));
  }
  Ok(stream)
}

// ── Dictionary helpers ──────────────────────────────────────────

pub(crate) fn get_dict_int(dict: &lopdf::Dictionary, key: &[u8]) -> Option<i64> {
  match dict.get(key).ok()? {
    Object::Integer(i) => Some(*i),
    _ => None,
  }
}

pub(crate) fn resolve_color_space(doc: &Document, dict: &lopdf::Dictionary) -> String {
  let cs = match dict.get(b"ColorSpace") {
    Ok(obj) => obj,
    Err(_) => return "DeviceRGB".to_string(),
  };

  match cs {
    Object::Name(name) => String::from_utf8_lossy(name).to_string(),
    Object::Reference(id) => match doc.get_object(*id) {
      Ok(Object::Name(name)) => String::from_utf8_lossy(name).to_string(),
      Ok(Object::Array(arr)) => parse_color_space_array(arr, doc),
      _ => "DeviceRGB".to_string(),
    },
    Object::Array(arr) => parse_color_space_array(arr, doc),
    _ => "DeviceRGB".to_string(),
  }
}

fn parse_color_space_array(arr: &[Object], doc: &Document) -> String {
  if arr.is_empty() {
    return "DeviceRGB".to_string();
  }

  let cs_name = match &arr[0] {
    Object::Name(n) => String::from_utf8_lossy(n).to_string(),
    _ => return "DeviceRGB".to_string(),
  };

  if cs_name == "ICCBased" && arr.len() > 1 {
    // /N in the ICCBased stream carries the channel count.
    let stream_id = match &arr[1] {
      Object::Reference(id) => *id,
      _ => return "ICCBased".to_string(),
    };

    if let Ok(Object::Stream(s)) = doc.get_object(stream_id) {
      let n = get_dict_int(&s.dict, b"N").unwrap_or(3);
      return format!("ICCBased{n}");
    }
  }

  cs_name
}

pub(crate) fn resolve_filter(dict: &lopdf::Dictionary) -> Option<String> {
  match dict.get(b"Filter") {
    Ok(Object::Name(name)) => Some(String::from_utf8_lossy(name).to_string()),
    Ok(Object::Array(arr)) => {
      // Filter chain — the last (innermost) filter decides the image type.
      if let Some(Object::Name(name)) = arr.last() {
        Some(String::from_utf8_lossy(name).to_string())
      } else {
        None
      }
    }
    _ => None,
  }
}

/// Resolve /DecodeParms, following indirect references. For filter chains
/// the first dictionary entry found is used.
fn resolve_decode_parms(doc: &Document, dict: &lopdf::Dictionary) -> Option<lopdf::Dictionary> {
  let dp = dict.get(b"DecodeParms").ok()?;
  match dp {
    Object::Dictionary(d) => Some(d.clone()),
    Object::Reference(id) => match doc.get_object(*id) {
      Ok(Object::Dictionary(d)) => Some(d.clone()),
      _ => None,
    },
    Object::Array(arr) => {
      for item in arr {
        match item {
          Object::Dictionary(d) => return Some(d.clone()),
          Object::Reference(id) => {
            if let Ok(Object::Dictionary(d)) = doc.get_object(*id) {
              return Some(d.clone());
            }
          }
          _ => {}
        }
      }
      None
    }
    _ => None,
  }
}

// ── Stream decompression ────────────────────────────────────────

/// Decompress a stream's content with explicit predictor handling.
///
/// lopdf's built-in `decompress()` attempts predictor unfiltering itself
/// and corrupts some streams (xdvipdfmx/pandoc output among them), so we
/// inflate raw via `flate2` and reverse predictors ourselves.
pub(crate) fn decompress_stream_content(
  doc: &Document,
  stream: &lopdf::Stream,
  width: u32,
  height: u32,
  channels: u32,
  bpc: u32,
) -> Vec<u8> {
  let bytes_per_sample = if bpc > 8 { 2u32 } else { 1u32 };
  let row_bytes = ((width * channels * bpc) as usize).div_ceil(8);
  let expected = (width * height * channels * bytes_per_sample) as usize;
  let predicted_len = height as usize * (row_bytes + 1);

  let uses_flate = match stream.dict.get(b"Filter") {
    Ok(Object::Name(n)) => n == b"FlateDecode",
    Ok(Object::Array(arr)) => arr
      .iter()
      .any(|o| matches!(o, Object::Name(n) if n == b"FlateDecode")),
    _ => false,
  };

  let content = if uses_flate {
    raw_inflate(&stream.content).unwrap_or_else(|| {
      // Let lopdf try — it handles edge cases like chained filters.
      let mut s = stream.clone();
      if s.decompress().is_ok() {
        s.content
      } else {
        stream.content.clone()
      }
    })
  } else {
    stream.content.clone()
  };

  if let Some(dp) = resolve_decode_parms(doc, &stream.dict) {
    let predictor = get_dict_int(&dp, b"Predictor").unwrap_or(1);

    // TIFF Predictor 2: horizontal differencing, same size as raw pixels.
    if predictor == 2 && content.len() == expected {
      let bpp = (channels * bpc / 8).max(1) as usize;
      let mut data = content;
      apply_tiff_predictor2(&mut data, bpp, row_bytes);
      return data;
    }

    // PNG predictors 10-15: each row carries a leading filter-type byte.
    if (10..=15).contains(&predictor) && content.len() == predicted_len {
      let bpp = (channels * bpc / 8).max(1) as usize;
      if let Some(unfiltered) = apply_png_predictor(&content, bpp, row_bytes) {
        return unfiltered;
      }
    }
  }

  content
}

/// Raw zlib inflate without any predictor handling.
fn raw_inflate(data: &[u8]) -> Option<Vec<u8>> {
  use std::io::Read;
  // zlib wrapper first (most common in PDF), then bare deflate.
  let mut output = Vec::new();
  if flate2::read::ZlibDecoder::new(data)
    .read_to_end(&mut output)
    .is_ok()
  {
    return Some(output);
  }
  output.clear();
  if flate2::read::DeflateDecoder::new(data)
    .read_to_end(&mut output)
    .is_ok()
  {
    return Some(output);
  }
  None
}

/// Reverse PNG row filtering. Each source row is a 1-byte filter type
/// followed by `row_bytes` of filtered data.
fn apply_png_predictor(data: &[u8], bytes_per_pixel: usize, row_bytes: usize) -> Option<Vec<u8>> {
  let src_row_len = row_bytes + 1;
  if !data.len().is_multiple_of(src_row_len) {
    return None;
  }
  let num_rows = data.len() / src_row_len;
  let mut output = Vec::with_capacity(num_rows * row_bytes);
  let mut prev_row = vec![0u8; row_bytes];

  for row_idx in 0..num_rows {
    let row_start = row_idx * src_row_len;
    let filter_byte = data[row_start];
    let mut current_row = data[row_start + 1..row_start + src_row_len].to_vec();

    match filter_byte {
      0 => { /* None */ }
      1 => {
        // Sub
        for i in bytes_per_pixel..row_bytes {
          current_row[i] = current_row[i].wrapping_add(current_row[i - bytes_per_pixel]);
        }
      }
      2 => {
        // Up
        for i in 0..row_bytes {
          current_row[i] = current_row[i].wrapping_add(prev_row[i]);
        }
      }
      3 => {
        // Average
        for i in 0..bytes_per_pixel {
          current_row[i] = current_row[i].wrapping_add(prev_row[i] / 2);
        }
        for i in bytes_per_pixel..row_bytes {
          current_row[i] = current_row[i].wrapping_add(
            ((current_row[i - bytes_per_pixel] as u16 + prev_row[i] as u16) / 2) as u8,
          );
        }
      }
      4 => {
        // Paeth
        for i in 0..bytes_per_pixel {
          current_row[i] = current_row[i].wrapping_add(paeth_predictor(0, prev_row[i], 0));
        }
        for i in bytes_per_pixel..row_bytes {
          current_row[i] = current_row[i].wrapping_add(paeth_predictor(
            current_row[i - bytes_per_pixel],
            prev_row[i],
            prev_row[i - bytes_per_pixel],
          ));
        }
      }
      _ => return None,
    }

    output.extend_from_slice(&current_row);
    prev_row = current_row;
  }

  Some(output)
}

fn paeth_predictor(a: u8, b: u8, c: u8) -> u8 {
  let pa = (b as i16 - c as i16).abs();
  let pb = (a as i16 - c as i16).abs();
  let pc = (a as i16 + b as i16 - 2 * c as i16).abs();
  if pa <= pb && pa <= pc {
    a
  } else if pb <= pc {
    b
  } else {
    c
  }
}

/// Reverse TIFF Predictor 2 (horizontal differencing) in place.
fn apply_tiff_predictor2(data: &mut [u8], bpp: usize, row_bytes: usize) {
  if row_bytes == 0 {
    return;
  }
  let num_rows = data.len() / row_bytes;
  for row in 0..num_rows {
    let start = row * row_bytes;
    for i in (start + bpp)..(start + row_bytes) {
      data[i] = data[i].wrapping_add(data[i - bpp]);
    }
  }
}

// ── Sample normalization ────────────────────────────────────────

/// Bring decoded samples to one byte per component: sub-byte depths are
/// expanded with full-range scaling, 16-bit is truncated to its high byte.
fn normalize_to_8bit(content: &[u8], width: u32, height: u32, channels: u32, bpc: u32) -> Option<Vec<u8>> {
  let pixel_samples = (width * height * channels) as usize;

  match bpc {
    8 => {
      if content.len() < pixel_samples {
        return None;
      }
      Some(content[..pixel_samples].to_vec())
    }
    16 => {
      if content.len() < pixel_samples * 2 {
        return None;
      }
      Some(
        content[..pixel_samples * 2]
          .chunks_exact(2)
          .map(|pair| (u16::from_be_bytes([pair[0], pair[1]]) >> 8) as u8)
          .collect(),
      )
    }
    1 | 2 | 4 => {
      let row_samples = (width * channels) as usize;
      let row_bytes = (row_samples * bpc as usize).div_ceil(8);
      if content.len() < row_bytes * height as usize {
        return None;
      }
      let max = (1u16 << bpc) - 1;
      let mut out = Vec::with_capacity(pixel_samples);
      for row in content.chunks_exact(row_bytes).take(height as usize) {
        let mut taken = 0usize;
        'row: for byte in row {
          let mut shift = 8 - bpc as i32;
          while shift >= 0 {
            if taken == row_samples {
              break 'row;
            }
            let v = (byte >> shift) as u16 & max;
            out.push((v * 255 / max) as u8);
            taken += 1;
            shift -= bpc as i32;
          }
        }
      }
      Some(out)
    }
    _ => None,
  }
}

fn cmyk_to_rgb(c: u8, m: u8, y: u8, k: u8) -> [u8; 3] {
  let c = c as f32 / 255.0;
  let m = m as f32 / 255.0;
  let y = y as f32 / 255.0;
  let k = k as f32 / 255.0;
  [
    (255.0 * (1.0 - c) * (1.0 - k)) as u8,
    (255.0 * (1.0 - m) * (1.0 - k)) as u8,
    (255.0 * (1.0 - y) * (1.0 - k)) as u8,
  ]
}

fn resample_nearest(src: &[u8], sw: u32, sh: u32, dw: u32, dh: u32) -> Vec<u8> {
  if (sw, sh) == (dw, dh) {
    let len = ((sw * sh) as usize).min(src.len());
    return src[..len].to_vec();
  }
  let mut out = Vec::with_capacity((dw * dh) as usize);
  for y in 0..dh {
    let sy = (y as u64 * sh as u64 / dh as u64) as u32;
    for x in 0..dw {
      let sx = (x as u64 * sw as u64 / dw as u64) as u32;
      out.push(*src.get((sy * sw + sx) as usize).unwrap_or(&0));
    }
  }
  out
}
