//! Diagnostic preview rasters.
//!
//! A preview places the input slice (min-max stretched to gray) to the
//! left of the reconstructed foreground probability, mapped from a dark
//! background color at 0 to a bright foreground color at 1.

use image::{ImageEncoder, Rgb, RgbImage};
use voxblend_engine::PreviewSlice;

use crate::ExportError;

/// Color of probability 0.
pub const PREVIEW_BACKGROUND: [u8; 3] = [0x12, 0x12, 0x1c];

/// Color of probability 1.
pub const PREVIEW_FOREGROUND: [u8; 3] = [0xf5, 0xc2, 0x42];

/// Pixel columns separating the two panels.
const GAP: u32 = 4;

/// File name used for the preview of original slice `z`.
#[must_use]
pub fn preview_file_name(z: usize) -> String {
    format!("preview_z{z:05}.png")
}

/// Render a side-by-side preview image.
///
/// Rows are the slice's X axis and columns its Y axis.
///
/// # Errors
///
/// Returns [`ExportError::Dimension`] if the slice is too large for an
/// image or the two panels differ in shape.
pub fn render_preview(slice: &PreviewSlice) -> Result<RgbImage, ExportError> {
    let (rows, columns) = slice.input.dim();
    if slice.prediction.dim() != (rows, columns) {
        return Err(ExportError::Dimension { rows, columns });
    }
    let panel_width = u32::try_from(columns).map_err(|_| ExportError::Dimension { rows, columns })?;
    let height = u32::try_from(rows).map_err(|_| ExportError::Dimension { rows, columns })?;
    let width = panel_width
        .checked_mul(2)
        .and_then(|w| w.checked_add(GAP))
        .ok_or(ExportError::Dimension { rows, columns })?;

    let (lo, hi) = slice
        .input
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = hi - lo;

    let mut image = RgbImage::from_pixel(width, height, Rgb(PREVIEW_BACKGROUND));
    for ((row, column), &value) in slice.input.indexed_iter() {
        let level = if range > 0.0 { (value - lo) / range } else { 0.0 };
        let gray = to_u8(level);
        image.put_pixel(column_u32(column), row_u32(row), Rgb([gray; 3]));
    }
    for ((row, column), &p) in slice.prediction.indexed_iter() {
        let color = blend(PREVIEW_BACKGROUND, PREVIEW_FOREGROUND, p);
        image.put_pixel(
            panel_width + GAP + column_u32(column),
            row_u32(row),
            Rgb(color),
        );
    }
    Ok(image)
}

/// Render a preview and encode it as PNG bytes.
///
/// # Errors
///
/// Returns the errors of [`render_preview`] and [`ExportError::Png`] if
/// encoding fails.
pub fn encode_preview_png(slice: &PreviewSlice) -> Result<Vec<u8>, ExportError> {
    let image = render_preview(slice)?;
    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(png_bytes)
}

/// Interpolate between two colors; `t` is clamped to `[0, 1]` and NaN
/// maps to `bg`.
fn blend(bg: [u8; 3], fg: [u8; 3], t: f32) -> [u8; 3] {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = f32::from(bg[c]).mul_add(1.0 - t, f32::from(fg[c]) * t);
        out[c] = to_u8(v / 255.0);
    }
    out
}

/// Map `[0, 1]` to `0..=255`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(level: f32) -> u8 {
    let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
    (level * 255.0).round() as u8
}

// Callers have already checked that rows and columns fit in u32.
#[allow(clippy::cast_possible_truncation)]
const fn row_u32(row: usize) -> u32 {
    row as u32
}

#[allow(clippy::cast_possible_truncation)]
const fn column_u32(column: usize) -> u32 {
    column as u32
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn slice() -> PreviewSlice {
        PreviewSlice {
            z: 7,
            input: Array2::from_shape_fn((3, 4), |(x, y)| {
                f32::from(u8::try_from(x * 4 + y).unwrap())
            }),
            prediction: Array2::from_shape_fn((3, 4), |(_, y)| if y < 2 { 0.0 } else { 1.0 }),
        }
    }

    #[test]
    fn preview_places_panels_side_by_side() {
        let image = render_preview(&slice()).unwrap();
        assert_eq!(image.dimensions(), (4 * 2 + GAP, 3));

        // Input panel is min-max stretched.
        assert_eq!(image.get_pixel(0, 0).0, [0; 3]);
        assert_eq!(image.get_pixel(3, 2).0, [255; 3]);

        // Prediction panel maps 0 and 1 to the theme colors.
        assert_eq!(image.get_pixel(4 + GAP, 0).0, PREVIEW_BACKGROUND);
        assert_eq!(image.get_pixel(4 + GAP + 3, 1).0, PREVIEW_FOREGROUND);
    }

    #[test]
    fn flat_input_renders_black() {
        let mut s = slice();
        s.input.fill(42.0);
        let image = render_preview(&s).unwrap();
        assert_eq!(image.get_pixel(1, 1).0, [0; 3]);
    }

    #[test]
    fn mismatched_panels_are_rejected() {
        let mut s = slice();
        s.prediction = Array2::zeros((2, 4));
        assert!(matches!(
            render_preview(&s),
            Err(ExportError::Dimension { rows: 3, columns: 4 })
        ));
    }

    #[test]
    fn png_bytes_have_signature() {
        let bytes = encode_preview_png(&slice()).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn blend_clamps_and_handles_nan() {
        assert_eq!(blend([0; 3], [200; 3], 2.0), [200; 3]);
        assert_eq!(blend([10; 3], [200; 3], f32::NAN), [10; 3]);
        assert_eq!(blend([0; 3], [200; 3], 0.5), [100; 3]);
    }

    #[test]
    fn file_names_sort_by_slice() {
        assert_eq!(preview_file_name(12), "preview_z00012.png");
    }
}
