//! IDX-format MNIST reading.
//!
//! The four standard files (`train-images-idx3-ubyte` and friends) share the
//! big-endian IDX layout: a magic number, one count per dimension, then raw
//! bytes. Images load as `(samples, 1, rows, cols)` tensors of `f32` in
//! [0, 1]; [`normalize_images`] applies the usual mean/std standardization
//! afterwards.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use ndarray::Array4;

/// Pixel mean of the MNIST training set, after scaling to [0, 1].
pub const MNIST_MEAN: f32 = 0.1307;
/// Pixel standard deviation of the MNIST training set.
pub const MNIST_STD: f32 = 0.30801;

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

fn read_be_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn bad_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reads an IDX image file into a `(samples, 1, rows, cols)` tensor with
/// pixels scaled to [0, 1].
pub fn load_mnist_images(path: &Path) -> io::Result<Array4<f32>> {
    let mut file = File::open(path)?;
    let magic = read_be_u32(&mut file)?;
    if magic != IMAGE_MAGIC {
        return Err(bad_data(format!(
            "bad image magic {} in {}",
            magic,
            path.display()
        )));
    }
    let count = read_be_u32(&mut file)? as usize;
    let rows = read_be_u32(&mut file)? as usize;
    let cols = read_be_u32(&mut file)? as usize;

    let mut pixels = vec![0u8; count * rows * cols];
    file.read_exact(&mut pixels)?;
    let scaled: Vec<f32> = pixels.iter().map(|&p| p as f32 / 255.0).collect();
    Array4::from_shape_vec((count, 1, rows, cols), scaled)
        .map_err(|e| bad_data(format!("inconsistent image header in {}: {}", path.display(), e)))
}

/// Reads an IDX label file.
pub fn load_mnist_labels(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let magic = read_be_u32(&mut file)?;
    if magic != LABEL_MAGIC {
        return Err(bad_data(format!(
            "bad label magic {} in {}",
            magic,
            path.display()
        )));
    }
    let count = read_be_u32(&mut file)? as usize;
    let mut labels = vec![0u8; count];
    file.read_exact(&mut labels)?;
    Ok(labels)
}

fn load_pair(
    dir: &Path,
    image_file: &str,
    label_file: &str,
) -> io::Result<(Array4<f32>, Vec<u8>)> {
    let images = load_mnist_images(&dir.join(image_file))?;
    let labels = load_mnist_labels(&dir.join(label_file))?;
    if images.dim().0 != labels.len() {
        return Err(bad_data(format!(
            "{} images but {} labels under {}",
            images.dim().0,
            labels.len(),
            dir.display()
        )));
    }
    Ok((images, labels))
}

/// Loads the 60k-sample training split from `dir`.
pub fn load_mnist_train(dir: &Path) -> io::Result<(Array4<f32>, Vec<u8>)> {
    load_pair(dir, "train-images-idx3-ubyte", "train-labels-idx1-ubyte")
}

/// Loads the 10k-sample test split from `dir`.
pub fn load_mnist_test(dir: &Path) -> io::Result<(Array4<f32>, Vec<u8>)> {
    load_pair(dir, "t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte")
}

/// Standardizes pixels in place: `(x - mean) / std`. `std` must be nonzero.
pub fn normalize_images(images: &mut Array4<f32>, mean: f32, std: f32) {
    images.mapv_inplace(|x| (x - mean) / std);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::path::PathBuf;

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("capsnet-mnist-{}-{}", std::process::id(), name));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn image_file(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGE_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&count.to_be_bytes());
        bytes.extend_from_slice(&rows.to_be_bytes());
        bytes.extend_from_slice(&cols.to_be_bytes());
        bytes.extend_from_slice(pixels);
        bytes
    }

    #[test]
    fn test_load_images_scales_to_unit_interval() {
        let path = write_temp(
            "images-ok",
            &image_file(2, 2, 2, &[0, 51, 102, 153, 204, 255, 0, 255]),
        );
        let images = load_mnist_images(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(images.dim(), (2, 1, 2, 2));
        assert_abs_diff_eq!(images[[0, 0, 0, 0]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(images[[0, 0, 0, 1]], 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(images[[1, 0, 0, 1]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_load_images_rejects_wrong_magic() {
        let mut bytes = image_file(1, 1, 1, &[7]);
        bytes[3] = 0x0A;
        let path = write_temp("images-magic", &bytes);
        let result = load_mnist_images(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn test_load_images_rejects_truncated_file() {
        // Header promises 4 pixels, body carries 2.
        let path = write_temp("images-short", &image_file(1, 2, 2, &[1, 2]));
        let result = load_mnist_images(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn test_load_labels() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABEL_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[5, 0, 9]);
        let path = write_temp("labels-ok", &bytes);
        let labels = load_mnist_labels(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(labels, vec![5, 0, 9]);
    }

    #[test]
    fn test_normalize_images() {
        let mut images = Array4::<f32>::from_elem((1, 1, 1, 2), 0.1307);
        normalize_images(&mut images, MNIST_MEAN, MNIST_STD);
        assert_abs_diff_eq!(images[[0, 0, 0, 0]], 0.0, epsilon = 1e-5);
    }
}
