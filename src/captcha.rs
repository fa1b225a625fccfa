use image::GrayImage;
use log::debug;
use once_cell::sync::Lazy;

const GLYPH_COLS: usize = 5;
const GLYPH_ROWS: usize = 7;

// 5x7 dot-matrix reference glyphs for the digit captcha the portal serves.
const DIGIT_TEMPLATES: [(char, [&str; GLYPH_ROWS]); 10] = [
    ('0', [".###.", "#...#", "#..##", "#.#.#", "##..#", "#...#", ".###."]),
    ('1', ["..#..", ".##..", "..#..", "..#..", "..#..", "..#..", ".###."]),
    ('2', [".###.", "#...#", "....#", "...#.", "..#..", ".#...", "#####"]),
    ('3', ["#####", "...#.", "..#..", "...#.", "....#", "#...#", ".###."]),
    ('4', ["...#.", "..##.", ".#.#.", "#..#.", "#####", "...#.", "...#."]),
    ('5', ["#####", "#....", "####.", "....#", "....#", "#...#", ".###."]),
    ('6', ["..##.", ".#...", "#....", "####.", "#...#", "#...#", ".###."]),
    ('7', ["#####", "....#", "...#.", "..#..", ".#...", ".#...", ".#..."]),
    ('8', [".###.", "#...#", "#...#", ".###.", "#...#", "#...#", ".###."]),
    ('9', [".###.", "#...#", "#...#", ".####", "....#", "...#.", ".##.."]),
];

// Templates go through the same bounding-box resampling as scanned glyphs,
// so narrow digits (the 1) compare in the same coordinate system.
static PARSED_TEMPLATES: Lazy<Vec<(char, [[bool; GLYPH_COLS]; GLYPH_ROWS])>> = Lazy::new(|| {
    DIGIT_TEMPLATES
        .iter()
        .map(|(ch, rows)| {
            let cell = |x: u32, y: u32| rows[y as usize].as_bytes()[x as usize] == b'#';
            let (x0, x1, y0, y1) =
                ink_bounds(&cell, GLYPH_COLS as u32, GLYPH_ROWS as u32).expect("blank template");
            (*ch, resample(&cell, x0, x1, y0, y1))
        })
        .collect()
});

#[derive(Debug)]
pub enum CaptchaError {
    /// Response body is not a decodable image.
    Decode(String),
    /// No glyph-shaped regions were found in the image.
    NoGlyphs,
}

impl std::fmt::Display for CaptchaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptchaError::Decode(detail) => write!(f, "captcha image undecodable: {}", detail),
            CaptchaError::NoGlyphs => write!(f, "no glyphs found in captcha image"),
        }
    }
}

impl std::error::Error for CaptchaError {}

/// Turns challenge-image bytes into the text the server expects. The default
/// implementation is template matching; tests substitute stubs.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image_bytes: &[u8]) -> Result<String, CaptchaError>;
}

/// Matches binarized glyph segments against the embedded dot-matrix digits.
/// No confidence threshold is applied locally: the save endpoint rejecting
/// the code is the real oracle, and a wrong read just costs one retry.
pub struct TemplateRecognizer;

impl Recognizer for TemplateRecognizer {
    fn recognize(&self, image_bytes: &[u8]) -> Result<String, CaptchaError> {
        let decoded = image::load_from_memory(image_bytes)
            .map_err(|e| CaptchaError::Decode(e.to_string()))?;
        let gray = decoded.to_luma8();
        let text = read_glyphs(&gray)?;
        debug!("[CAPTCHA] recognized '{}'", text);
        Ok(text.trim().to_string())
    }
}

fn read_glyphs(gray: &GrayImage) -> Result<String, CaptchaError> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Err(CaptchaError::NoGlyphs);
    }

    // Binarize against the mean: glyphs are dark on a light background.
    let sum: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    let mean = (sum / (width as u64 * height as u64)) as u8;
    let dark = |x: u32, y: u32| gray.get_pixel(x, y).0[0] < mean;

    // Segment on blank columns.
    let mut segments: Vec<(u32, u32)> = Vec::new();
    let mut run_start: Option<u32> = None;
    for x in 0..width {
        let has_ink = (0..height).any(|y| dark(x, y));
        match (has_ink, run_start) {
            (true, None) => run_start = Some(x),
            (false, Some(start)) => {
                segments.push((start, x));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        segments.push((start, width));
    }
    segments.retain(|(start, end)| end - start >= 2);
    if segments.is_empty() {
        return Err(CaptchaError::NoGlyphs);
    }

    let mut out = String::new();
    for (x0, x1) in segments {
        // Crop the segment to its ink rows.
        let y0 = (0..height)
            .find(|&y| (x0..x1).any(|x| dark(x, y)))
            .unwrap_or(0);
        let y1 = (0..height)
            .rev()
            .find(|&y| (x0..x1).any(|x| dark(x, y)))
            .unwrap_or(height - 1)
            + 1;
        out.push(classify_glyph(&dark, x0, x1, y0, y1));
    }
    Ok(out)
}

/// Ink bounding box of a rectangular region, or None if it is blank.
fn ink_bounds(dark: &dyn Fn(u32, u32) -> bool, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x0 = (0..width).find(|&x| (0..height).any(|y| dark(x, y)))?;
    let x1 = (0..width).rev().find(|&x| (0..height).any(|y| dark(x, y)))? + 1;
    let y0 = (0..height).find(|&y| (x0..x1).any(|x| dark(x, y)))?;
    let y1 = (0..height).rev().find(|&y| (x0..x1).any(|x| dark(x, y)))? + 1;
    Some((x0, x1, y0, y1))
}

/// Majority-downsamples the bounding box onto the template grid; exact ties
/// count as ink so scaled glyphs and 1x1 templates land on the same side.
fn resample(
    dark: &dyn Fn(u32, u32) -> bool,
    x0: u32,
    x1: u32,
    y0: u32,
    y1: u32,
) -> [[bool; GLYPH_COLS]; GLYPH_ROWS] {
    let mut grid = [[false; GLYPH_COLS]; GLYPH_ROWS];
    let w = x1 - x0;
    let h = y1 - y0;
    for (cy, row) in grid.iter_mut().enumerate() {
        for (cx, cell) in row.iter_mut().enumerate() {
            let sx0 = x0 + (cx as u32 * w) / GLYPH_COLS as u32;
            let sx1 = (x0 + ((cx as u32 + 1) * w) / GLYPH_COLS as u32).max(sx0 + 1);
            let sy0 = y0 + (cy as u32 * h) / GLYPH_ROWS as u32;
            let sy1 = (y0 + ((cy as u32 + 1) * h) / GLYPH_ROWS as u32).max(sy0 + 1);
            let mut ink = 0u32;
            let mut total = 0u32;
            for x in sx0..sx1 {
                for y in sy0..sy1 {
                    total += 1;
                    if dark(x, y) {
                        ink += 1;
                    }
                }
            }
            *cell = ink * 2 >= total.max(1) && ink > 0;
        }
    }
    grid
}

/// Picks the digit whose resampled template agrees with the glyph on the
/// most cells.
fn classify_glyph(dark: &dyn Fn(u32, u32) -> bool, x0: u32, x1: u32, y0: u32, y1: u32) -> char {
    let grid = resample(dark, x0, x1, y0, y1);

    PARSED_TEMPLATES
        .iter()
        .map(|(ch, template)| {
            let score: usize = template
                .iter()
                .zip(grid.iter())
                .map(|(trow, grow)| trow.iter().zip(grow.iter()).filter(|(a, b)| a == b).count())
                .sum();
            (score, *ch)
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, ch)| ch)
        .unwrap_or('?')
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma};
    use std::io::Cursor;

    /// Renders `digits` from the reference templates at the given scale with
    /// a margin and inter-glyph gap, PNG-encoded.
    fn render_captcha(digits: &str, scale: u32) -> Vec<u8> {
        let margin = 3 * scale;
        let gap = 2 * scale;
        let glyph_w = GLYPH_COLS as u32 * scale;
        let glyph_h = GLYPH_ROWS as u32 * scale;
        let count = digits.len() as u32;
        let width = 2 * margin + count * glyph_w + (count - 1) * gap;
        let height = 2 * margin + glyph_h;

        let mut img = GrayImage::from_pixel(width, height, Luma([255u8]));
        for (i, ch) in digits.chars().enumerate() {
            let (_, rows) = DIGIT_TEMPLATES
                .iter()
                .find(|(c, _)| *c == ch)
                .expect("digit template");
            let ox = margin + i as u32 * (glyph_w + gap);
            for (y, row) in rows.iter().enumerate() {
                for (x, cell) in row.bytes().enumerate() {
                    if cell == b'#' {
                        for dy in 0..scale {
                            for dx in 0..scale {
                                img.put_pixel(
                                    ox + x as u32 * scale + dx,
                                    margin + y as u32 * scale + dy,
                                    Luma([0u8]),
                                );
                            }
                        }
                    }
                }
            }
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("png encode");
        buf
    }

    #[test]
    fn recognizes_rendered_digits() {
        let bytes = render_captcha("1234", 4);
        let text = TemplateRecognizer.recognize(&bytes).unwrap();
        assert_eq!(text, "1234");
    }

    #[test]
    fn recognizes_every_digit() {
        let bytes = render_captcha("0123456789", 3);
        let text = TemplateRecognizer.recognize(&bytes).unwrap();
        assert_eq!(text, "0123456789");
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        let err = TemplateRecognizer.recognize(b"not an image").unwrap_err();
        assert!(matches!(err, CaptchaError::Decode(_)));
    }

    #[test]
    fn blank_image_has_no_glyphs() {
        let img = GrayImage::from_pixel(40, 20, Luma([255u8]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("png encode");
        let err = TemplateRecognizer.recognize(&buf).unwrap_err();
        assert!(matches!(err, CaptchaError::NoGlyphs));
    }
}
