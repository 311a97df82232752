//! テスト用の一時ディレクトリと合成データセット

use std::path::{Path, PathBuf};

/// テストごとの空の作業ディレクトリ
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("garbage_classifier_tests")
        .join(format!("{}_{}", name, std::process::id()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir).unwrap();
    }
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// クラスごとの色で塗った小さなPNGを書き込む
///
/// クラス `i` の画像は赤チャネルが `i` に応じて変わり、
/// 画像ごとに緑チャネルが少しずつ変わる。
pub fn write_image_folder(root: &Path, classes: &[(&str, usize)], size: u32) {
    for (class_index, (class, count)) in classes.iter().enumerate() {
        let class_dir = root.join(class);
        std::fs::create_dir_all(&class_dir).unwrap();
        for i in 0..*count {
            let red = (class_index * 40 % 256) as u8;
            let green = (i * 7 % 256) as u8;
            image::RgbImage::from_pixel(size, size, image::Rgb([red, green, 200]))
                .save(class_dir.join(format!("{}{}.png", class, i)))
                .unwrap();
        }
    }
}
