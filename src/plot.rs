//! 学習曲線の描画
//!
//! 上段に正解率、下段に損失を描いた PNG を出力する。
//! 学習データは青、検証データは橙の折れ線。タイトル・凡例・軸ラベルは
//! 5x7 のビットマップ文字（英大文字・数字）で書く。

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use std::path::Path;

use crate::ml::training::TrainingHistory;

const WIDTH: u32 = 640;
const PANEL_HEIGHT: u32 = 300;
const LEFT_MARGIN: u32 = 56;
const RIGHT_MARGIN: u32 = 20;
const TOP_MARGIN: u32 = 48;
const BOTTOM_MARGIN: u32 = 36;
const TITLE_HEIGHT: u32 = 28;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([60, 60, 60]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
const TRAIN: Rgb<u8> = Rgb([31, 119, 180]);
const VALID: Rgb<u8> = Rgb([255, 127, 14]);
const TEXT: Rgb<u8> = Rgb([20, 20, 20]);

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

/// 5x7 の文字（各行の下位 5 ビット、左が上位）
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        _ => [0; 7],
    }
}

/// 文字列の描画幅
fn text_width(text: &str, scale: u32) -> u32 {
    let count = text.chars().count() as u32;
    (count * (GLYPH_WIDTH + 1)).saturating_sub(1) * scale
}

/// 左上を (x, y) として文字列を描く
fn draw_text(image: &mut RgbImage, x: i64, y: i64, text: &str, scale: u32, color: Rgb<u8>) {
    let scale = scale as i64;
    for (index, c) in text.chars().enumerate() {
        let left = x + index as i64 * (GLYPH_WIDTH as i64 + 1) * scale;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH as i64 {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        put(image, left + col * scale + dx, y + row as i64 * scale + dy, color);
                    }
                }
            }
        }
    }
}

/// 凡例の位置
#[derive(Debug, Clone, Copy)]
enum LegendCorner {
    UpperRight,
    LowerRight,
}

/// パネル内の描画領域
struct Panel {
    index: u32,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    y_min: f64,
    y_max: f64,
}

impl Panel {
    fn new(index: u32, y_min: f64, y_max: f64) -> Self {
        let (y_min, y_max) = if y_max - y_min < 1e-9 {
            (y_min - 0.5, y_max + 0.5)
        } else {
            (y_min, y_max)
        };
        Self {
            index,
            left: LEFT_MARGIN,
            top: index * PANEL_HEIGHT + TOP_MARGIN,
            width: WIDTH - LEFT_MARGIN - RIGHT_MARGIN,
            height: PANEL_HEIGHT - TOP_MARGIN - BOTTOM_MARGIN,
            y_min,
            y_max,
        }
    }

    fn point(&self, i: usize, count: usize, value: f64) -> (i64, i64) {
        let x = if count > 1 {
            self.left as f64 + self.width as f64 * i as f64 / (count - 1) as f64
        } else {
            self.left as f64 + self.width as f64 / 2.0
        };
        let ratio = ((value - self.y_min) / (self.y_max - self.y_min)).clamp(0.0, 1.0);
        let y = self.top as f64 + self.height as f64 * (1.0 - ratio);
        (x.round() as i64, y.round() as i64)
    }

    fn draw_frame(&self, image: &mut RgbImage) {
        for step in 1..4 {
            let y = self.top + self.height * step / 4;
            draw_line(image, (self.left as i64, y as i64), ((self.left + self.width) as i64, y as i64), GRID);
        }
        let bottom = (self.top + self.height) as i64;
        draw_line(image, (self.left as i64, self.top as i64), (self.left as i64, bottom), AXIS);
        draw_line(image, (self.left as i64, bottom), ((self.left + self.width) as i64, bottom), AXIS);
    }

    /// タイトル、軸ラベル、目盛り
    fn draw_labels(&self, image: &mut RgbImage, title: &str, y_label: &str, epochs: usize) {
        let region_top = (self.index * PANEL_HEIGHT) as i64;
        let title_x = (WIDTH.saturating_sub(text_width(title, 2)) / 2) as i64;
        draw_text(image, title_x, region_top + 8, title, 2, TEXT);
        draw_text(image, self.left as i64, region_top + TITLE_HEIGHT as i64 + 4, y_label, 1, TEXT);

        let bottom = (self.top + self.height) as i64;
        for (value, y) in [(self.y_max, self.top as i64), (self.y_min, bottom)] {
            let label = format!("{:.2}", value);
            let x = self.left as i64 - 6 - text_width(&label, 1) as i64;
            draw_text(image, x, y - GLYPH_HEIGHT as i64 / 2, &label, 1, TEXT);
        }

        let right = (self.left + self.width) as i64;
        let first = "1".to_string();
        let last = epochs.max(1).to_string();
        draw_text(image, self.left as i64 - 2, bottom + 6, &first, 1, TEXT);
        if epochs > 1 {
            draw_text(image, right - text_width(&last, 1) as i64 + 2, bottom + 6, &last, 1, TEXT);
        }
        let x_label = "Epoch";
        let x = self.left as i64 + (self.width as i64 - text_width(x_label, 1) as i64) / 2;
        draw_text(image, x, bottom + 18, x_label, 1, TEXT);
    }

    fn draw_legend(&self, image: &mut RgbImage, entries: &[(&str, Rgb<u8>)], corner: LegendCorner) {
        let widest = entries.iter().map(|(label, _)| text_width(label, 1)).max().unwrap_or(0);
        let line_height = GLYPH_HEIGHT as i64 + 6;
        let box_width = widest as i64 + 30;
        let box_height = entries.len() as i64 * line_height + 6;
        let left = (self.left + self.width) as i64 - box_width - 8;
        let top = match corner {
            LegendCorner::UpperRight => self.top as i64 + 8,
            LegendCorner::LowerRight => (self.top + self.height) as i64 - box_height - 8,
        };

        for y in top..top + box_height {
            for x in left..left + box_width {
                put(image, x, y, BACKGROUND);
            }
        }
        let right = left + box_width - 1;
        let bottom = top + box_height - 1;
        draw_line(image, (left, top), (right, top), GRID);
        draw_line(image, (left, bottom), (right, bottom), GRID);
        draw_line(image, (left, top), (left, bottom), GRID);
        draw_line(image, (right, top), (right, bottom), GRID);

        for (row, (label, color)) in entries.iter().enumerate() {
            let y = top + 6 + row as i64 * line_height;
            let middle = y + GLYPH_HEIGHT as i64 / 2;
            for dy in -1..=1 {
                draw_line(image, (left + 5, middle + dy), (left + 19, middle + dy), *color);
            }
            draw_text(image, left + 24, y, label, 1, TEXT);
        }
    }

    /// 非有限値の点は描かず、その前後も結ばない
    fn draw_series(&self, image: &mut RgbImage, values: &[f64], color: Rgb<u8>) {
        let points: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| v.is_finite().then(|| self.point(i, values.len(), *v)))
            .collect();
        for pair in points.windows(2) {
            if let (Some(from), Some(to)) = (pair[0], pair[1]) {
                draw_line(image, from, to, color);
            }
        }
        for (x, y) in points.into_iter().flatten() {
            for dx in -2..=2 {
                for dy in -2..=2 {
                    put(image, x + dx, y + dy, color);
                }
            }
        }
    }
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham の直線
fn draw_line(image: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put(image, x, y, color);
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

pub const ACCURACY_TITLE: &str = "Training and Validation Accuracy";
pub const LOSS_TITLE: &str = "Training and Validation Loss";

/// 学習履歴を描画した画像を作る
pub fn render_history(history: &TrainingHistory) -> RgbImage {
    let mut image = RgbImage::from_pixel(WIDTH, PANEL_HEIGHT * 2, BACKGROUND);

    let train_acc: Vec<f64> = history.epochs.iter().map(|s| s.train_accuracy).collect();
    let valid_acc: Vec<f64> = history.epochs.iter().map(|s| s.valid_accuracy).collect();
    let train_loss: Vec<f64> = history.epochs.iter().map(|s| s.train_loss).collect();
    let valid_loss: Vec<f64> = history.epochs.iter().map(|s| s.valid_loss).collect();

    // f64::min / max は NaN を無視する
    let min_acc = train_acc.iter().chain(&valid_acc).fold(1.0f64, |a, v| a.min(*v));
    let accuracy = Panel::new(0, min_acc, 1.0);
    let max_loss = train_loss.iter().chain(&valid_loss).fold(0.0f64, |a, v| a.max(*v));
    let loss = Panel::new(1, 0.0, max_loss);
    let epochs = history.len();

    accuracy.draw_frame(&mut image);
    loss.draw_frame(&mut image);
    accuracy.draw_labels(&mut image, ACCURACY_TITLE, "Accuracy", epochs);
    loss.draw_labels(&mut image, LOSS_TITLE, "Cross Entropy", epochs);
    accuracy.draw_series(&mut image, &train_acc, TRAIN);
    accuracy.draw_series(&mut image, &valid_acc, VALID);
    loss.draw_series(&mut image, &train_loss, TRAIN);
    loss.draw_series(&mut image, &valid_loss, VALID);
    accuracy.draw_legend(
        &mut image,
        &[("Training Accuracy", TRAIN), ("Validation Accuracy", VALID)],
        LegendCorner::LowerRight,
    );
    loss.draw_legend(
        &mut image,
        &[("Training Loss", TRAIN), ("Validation Loss", VALID)],
        LegendCorner::UpperRight,
    );

    image
}

/// 学習履歴を PNG に保存
pub fn save_history_plot(history: &TrainingHistory, path: &Path) -> Result<()> {
    render_history(history)
        .save(path)
        .with_context(|| format!("Failed to save plot: {}", path.display()))?;
    log::info!("学習曲線を保存しました: {}", path.display());
    Ok(())
}
