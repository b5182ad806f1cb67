use crate::error::DatasetError;
use ndarray::{Array1, Array3, Array4, Axis};
use std::path::Path;

pub mod idx;
pub mod split;

const GREYSCALE_SIZE: f64 = 255f64;

/// Paired glyph images and 0-based class ids
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array3<u8>,
    pub labels: Array1<u8>,
}

impl Dataset {
    /// Pair images with labels. Both must describe the same number of records.
    pub fn new(images: Array3<u8>, labels: Array1<u8>) -> Result<Dataset, DatasetError> {
        Dataset::paired(images, labels, "in-memory dataset")
    }

    /// Decode an image/label container pair and shift the labels down by `label_offset`
    /// onto `0..num_classes`
    pub fn load(
        images_path: &Path,
        labels_path: &Path,
        label_offset: u8,
        num_classes: usize,
    ) -> Result<Dataset, DatasetError> {
        let (images, images_header) = idx::decode_images(images_path)?;
        let labels_source = labels_path.display().to_string();
        let (raw_labels, _) = idx::decode_labels(labels_path)?;
        let labels =
            idx::shift_labels(&raw_labels.view(), label_offset, num_classes, &labels_source)?;

        tracing::info!(
            images = %images_path.display(),
            count = images_header.count,
            rows = images_header.rows,
            cols = images_header.cols,
            "decoded dataset"
        );

        Dataset::paired(
            images,
            labels,
            &format!("{} and {}", images_path.display(), labels_source),
        )
    }

    fn paired(
        images: Array3<u8>,
        labels: Array1<u8>,
        source_name: &str,
    ) -> Result<Dataset, DatasetError> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(DatasetError::LengthMismatch {
                source_name: source_name.to_string(),
                images: images.len_of(Axis(0)),
                labels: labels.len(),
            });
        }

        Ok(Dataset { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// (rows, cols) of a single glyph
    pub fn image_shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.images.dim();
        (rows, cols)
    }

    /// Copy out the records at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Dataset {
        Dataset {
            images: self.images.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }

    /// Network input for the records at `indices`: [n, 1, rows, cols], scaled to [0, 1]
    pub fn features(&self, indices: &[usize]) -> Array4<f64> {
        self.images
            .select(Axis(0), indices)
            .mapv(|x| x as f64 / GREYSCALE_SIZE)
            .insert_axis(Axis(1))
    }

    /// Labels of the records at `indices`
    pub fn labels_at(&self, indices: &[usize]) -> Vec<u8> {
        indices.iter().map(|&i| self.labels[i]).collect()
    }

    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &label in self.labels.iter() {
            if let Some(count) = counts.get_mut(label as usize) {
                *count += 1;
            }
        }

        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    fn toy() -> Dataset {
        let images = Array3::from_shape_vec((3, 1, 2), vec![0, 255, 51, 102, 7, 8]).unwrap();
        Dataset::new(images, array![2u8, 0, 2]).unwrap()
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let images = Array3::<u8>::zeros((4, 2, 2));

        let err = Dataset::new(images, array![0u8, 1, 2]).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::LengthMismatch {
                images: 4,
                labels: 3,
                ..
            }
        ));
    }

    #[test]
    fn features_are_normalized_with_a_channel_axis() {
        let dataset = toy();

        let features = dataset.features(&[1, 0]);

        assert_eq!(features.shape(), &[2, 1, 1, 2]);
        assert_eq!(features[[0, 0, 0, 0]], 0.2);
        assert_eq!(features[[1, 0, 0, 1]], 1.0);
    }

    #[test]
    fn select_keeps_pairs_together() {
        let dataset = toy();

        let picked = dataset.select(&[2, 1]);

        assert_eq!(picked.labels, array![2u8, 0]);
        assert_eq!(picked.images[[0, 0, 0]], 7);
        assert_eq!(picked.images[[1, 0, 1]], 102);
    }

    #[test]
    fn counts_classes() {
        assert_eq!(toy().class_counts(3), vec![1, 0, 2]);
    }

    fn write_images(count: u32, pixels: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for field in [idx::IMAGES_MAGIC, count, 1, 2] {
            file.write_all(&field.to_be_bytes()).unwrap();
        }
        file.write_all(pixels).unwrap();
        file
    }

    fn write_labels(labels: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&idx::LABELS_MAGIC.to_be_bytes()).unwrap();
        file.write_all(&(labels.len() as u32).to_be_bytes()).unwrap();
        file.write_all(labels).unwrap();
        file
    }

    #[test]
    fn load_pairs_decoded_images_with_shifted_labels() {
        let images = write_images(3, &[0, 255, 10, 20, 30, 40]);
        let labels = write_labels(&[1, 26, 5]);

        let dataset = Dataset::load(images.path(), labels.path(), 1, 26).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.image_shape(), (1, 2));
        assert_eq!(dataset.labels, array![0u8, 25, 4]);
        assert_eq!(dataset.images[[1, 0, 0]], 10);
        assert_eq!(dataset.images[[2, 0, 1]], 40);
    }

    #[test]
    fn load_rejects_mismatched_files_by_name() {
        let images = write_images(2, &[1, 2, 3, 4]);
        let labels = write_labels(&[1, 2, 3]);

        let err = Dataset::load(images.path(), labels.path(), 1, 26).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::LengthMismatch {
                images: 2,
                labels: 3,
                ..
            }
        ));
        let message = err.to_string();
        assert!(message.contains(&images.path().display().to_string()));
        assert!(message.contains(&labels.path().display().to_string()));
    }

    #[test]
    fn load_names_the_labels_file_on_a_zero_label() {
        let images = write_images(2, &[1, 2, 3, 4]);
        let labels = write_labels(&[3, 0]);

        let err = Dataset::load(images.path(), labels.path(), 1, 26).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::OutOfRangeLabel {
                index: 1,
                value: 0,
                offset: 1,
                ..
            }
        ));
        assert!(err
            .to_string()
            .contains(&labels.path().display().to_string()));
    }

    #[test]
    fn load_rejects_labels_past_the_alphabet() {
        let images = write_images(1, &[1, 2]);
        let labels = write_labels(&[27]);

        let err = Dataset::load(images.path(), labels.path(), 1, 26).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::LabelOutOfAlphabet {
                value: 27,
                offset: 1,
                num_classes: 26,
                ..
            }
        ));
        assert!(err
            .to_string()
            .contains(&labels.path().display().to_string()));
    }
}
