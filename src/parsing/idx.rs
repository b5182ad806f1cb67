use crate::error::DatasetError;
use ndarray::{Array1, Array3, ArrayView1};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Conventional magic of an unsigned-byte rank-3 container
pub const IMAGES_MAGIC: u32 = 0x0000_0803;
/// Conventional magic of an unsigned-byte rank-1 container
pub const LABELS_MAGIC: u32 = 0x0000_0801;

const IMAGES_HEADER_LEN: usize = 16;
const LABELS_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagesHeader {
    pub magic: u32,
    pub count: u32,
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelsHeader {
    pub magic: u32,
    pub count: u32,
}

/// Decode the image container at `path` into a [count, rows, cols] tensor
pub fn decode_images(path: &Path) -> Result<(Array3<u8>, ImagesHeader), DatasetError> {
    let source = path.display().to_string();
    let mut file = File::open(path).map_err(|error| io_error(&source, error))?;

    read_images(&mut file, &source)
}

/// Decode the label container at `path` into a vector of class ids
pub fn decode_labels(path: &Path) -> Result<(Array1<u8>, LabelsHeader), DatasetError> {
    let source = path.display().to_string();
    let mut file = File::open(path).map_err(|error| io_error(&source, error))?;

    read_labels(&mut file, &source)
}

/// Read an image container from any byte stream.
/// `source` only serves to name the input in errors and logs.
pub fn read_images<R: Read>(
    reader: &mut R,
    source: &str,
) -> Result<(Array3<u8>, ImagesHeader), DatasetError> {
    let bytes = read_all(reader, source)?;
    let fields = header_fields::<4>(&bytes, source)?;
    let header = ImagesHeader {
        magic: fields[0],
        count: fields[1],
        rows: fields[2],
        cols: fields[3],
    };

    if header.magic != IMAGES_MAGIC {
        tracing::warn!(
            source,
            magic = header.magic,
            "unexpected magic for an image container"
        );
    }

    let (count, rows, cols) = (
        header.count as usize,
        header.rows as usize,
        header.cols as usize,
    );
    let expected = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| DatasetError::MalformedHeader {
            source_name: source.to_string(),
            expected: IMAGES_HEADER_LEN,
            actual: bytes.len(),
        })?;
    let payload = checked_payload(bytes, IMAGES_HEADER_LEN, expected, source)?;

    // u8 samples have no byte order, so the payload is already host-native
    let images = Array3::from_shape_vec((count, rows, cols), payload)
        .expect("payload length was checked against the header");

    Ok((images, header))
}

/// Read a label container from any byte stream
pub fn read_labels<R: Read>(
    reader: &mut R,
    source: &str,
) -> Result<(Array1<u8>, LabelsHeader), DatasetError> {
    let bytes = read_all(reader, source)?;
    let fields = header_fields::<2>(&bytes, source)?;
    let header = LabelsHeader {
        magic: fields[0],
        count: fields[1],
    };

    if header.magic != LABELS_MAGIC {
        tracing::warn!(
            source,
            magic = header.magic,
            "unexpected magic for a label container"
        );
    }

    let payload = checked_payload(bytes, LABELS_HEADER_LEN, header.count as usize, source)?;

    Ok((Array1::from(payload), header))
}

/// Subtract `offset` from every label, producing a new vector.
/// Raw EMNIST letters are 1-based, so an offset of 1 maps them onto 0..=25.
/// Every shifted label must name one of `num_classes` classes.
pub fn shift_labels(
    labels: &ArrayView1<u8>,
    offset: u8,
    num_classes: usize,
    source: &str,
) -> Result<Array1<u8>, DatasetError> {
    labels
        .iter()
        .enumerate()
        .map(|(index, &value)| match value.checked_sub(offset) {
            Some(class) if (class as usize) < num_classes => Ok(class),
            Some(_) => Err(DatasetError::LabelOutOfAlphabet {
                source_name: source.to_string(),
                index,
                value,
                offset,
                num_classes,
            }),
            None => Err(DatasetError::OutOfRangeLabel {
                source_name: source.to_string(),
                index,
                value,
                offset,
            }),
        })
        .collect::<Result<Vec<u8>, _>>()
        .map(Array1::from)
}

fn io_error(source: &str, error: std::io::Error) -> DatasetError {
    DatasetError::Io {
        source_name: source.to_string(),
        error,
    }
}

fn read_all<R: Read>(reader: &mut R, source: &str) -> Result<Vec<u8>, DatasetError> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|error| io_error(source, error))?;

    Ok(bytes)
}

/// Parse the first N big-endian u32 fields of a header
fn header_fields<const N: usize>(bytes: &[u8], source: &str) -> Result<[u32; N], DatasetError> {
    let header_len = N * 4;
    if bytes.len() < header_len {
        return Err(DatasetError::MalformedHeader {
            source_name: source.to_string(),
            expected: header_len,
            actual: bytes.len(),
        });
    }

    let mut fields = [0u32; N];
    for (field, chunk) in fields.iter_mut().zip(bytes[..header_len].chunks_exact(4)) {
        *field = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    Ok(fields)
}

/// Strip the header and make sure the payload is exactly the declared size
fn checked_payload(
    mut bytes: Vec<u8>,
    header_len: usize,
    expected: usize,
    source: &str,
) -> Result<Vec<u8>, DatasetError> {
    let actual = bytes.len() - header_len;
    if actual != expected {
        return Err(DatasetError::TruncatedData {
            source_name: source.to_string(),
            expected,
            actual,
        });
    }

    bytes.drain(..header_len);

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};
    use proptest::prelude::*;
    use std::io::{Cursor, Write};

    fn encode_images(header: ImagesHeader, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for field in [header.magic, header.count, header.rows, header.cols] {
            bytes.extend_from_slice(&field.to_be_bytes());
        }
        bytes.extend_from_slice(payload);
        bytes
    }

    fn encode_labels(header: LabelsHeader, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&header.magic.to_be_bytes());
        bytes.extend_from_slice(&header.count.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn decodes_known_image_bytes() {
        let bytes: Vec<u8> = vec![
            0x00, 0x00, 0x08, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00,
            0x00, 0x02, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];

        let (images, header) = read_images(&mut Cursor::new(bytes), "images").unwrap();

        assert_eq!(images, array![[[1u8, 2], [3, 4]], [[5, 6], [7, 8]]]);
        assert_eq!(
            header,
            ImagesHeader {
                magic: IMAGES_MAGIC,
                count: 2,
                rows: 2,
                cols: 2
            }
        );
    }

    #[test]
    fn short_payload_is_truncated_data() {
        let header = ImagesHeader {
            magic: IMAGES_MAGIC,
            count: 2,
            rows: 2,
            cols: 2,
        };
        let bytes = encode_images(header, &[1, 2, 3, 4]);

        let err = read_images(&mut Cursor::new(bytes), "images").unwrap_err();

        assert!(matches!(
            err,
            DatasetError::TruncatedData {
                expected: 8,
                actual: 4,
                ..
            }
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let header = LabelsHeader {
            magic: LABELS_MAGIC,
            count: 2,
        };
        let bytes = encode_labels(header, &[1, 2, 3]);

        let err = read_labels(&mut Cursor::new(bytes), "labels").unwrap_err();

        assert!(matches!(
            err,
            DatasetError::TruncatedData {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn short_header_is_malformed() {
        let err = read_images(&mut Cursor::new(vec![0u8; 15]), "images").unwrap_err();
        assert!(matches!(
            err,
            DatasetError::MalformedHeader {
                expected: 16,
                actual: 15,
                ..
            }
        ));

        let err = read_labels(&mut Cursor::new(vec![0u8; 7]), "labels").unwrap_err();
        assert!(matches!(
            err,
            DatasetError::MalformedHeader {
                expected: 8,
                actual: 7,
                ..
            }
        ));
    }

    #[test]
    fn errors_name_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0, 0, 8, 1]).unwrap();

        let err = decode_labels(file.path()).unwrap_err();

        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = decode_images(&dir.path().join("absent-idx3-ubyte")).unwrap_err();

        assert!(matches!(err, DatasetError::Io { .. }));
    }

    #[test]
    fn decodes_files_from_disk() {
        let mut images_file = tempfile::NamedTempFile::new().unwrap();
        let header = ImagesHeader {
            magic: IMAGES_MAGIC,
            count: 3,
            rows: 1,
            cols: 2,
        };
        images_file
            .write_all(&encode_images(header, &[0, 255, 10, 20, 30, 40]))
            .unwrap();

        let mut labels_file = tempfile::NamedTempFile::new().unwrap();
        let label_header = LabelsHeader {
            magic: LABELS_MAGIC,
            count: 3,
        };
        labels_file
            .write_all(&encode_labels(label_header, &[1, 26, 5]))
            .unwrap();

        let (images, decoded_header) = decode_images(images_file.path()).unwrap();
        let (labels, decoded_label_header) = decode_labels(labels_file.path()).unwrap();

        assert_eq!(decoded_header, header);
        assert_eq!(images.shape(), &[3, 1, 2]);
        assert_eq!(images[[0, 0, 1]], 255);
        assert_eq!(decoded_label_header.count as usize, labels.len());
        assert_eq!(labels, array![1u8, 26, 5]);
    }

    #[test]
    fn unexpected_magic_is_not_fatal() {
        let header = LabelsHeader {
            magic: 0xdead_beef,
            count: 1,
        };
        let bytes = encode_labels(header, &[7]);

        let (labels, decoded) = read_labels(&mut Cursor::new(bytes), "labels").unwrap();

        assert_eq!(decoded.magic, 0xdead_beef);
        assert_eq!(labels, array![7u8]);
    }

    #[test]
    fn shift_maps_letters_onto_zero_based_classes() {
        let raw: Array1<u8> = (1..=26).collect();

        let shifted = shift_labels(&raw.view(), 1, 26, "labels").unwrap();

        assert_eq!(shifted, (0..26).collect::<Array1<u8>>());
        // the input is left untouched
        assert_eq!(raw[0], 1);
    }

    #[test]
    fn shift_below_zero_is_out_of_range() {
        let raw = array![3u8, 1, 0, 4];

        let err = shift_labels(&raw.view(), 1, 26, "letters-labels").unwrap_err();

        assert!(matches!(
            err,
            DatasetError::OutOfRangeLabel {
                index: 2,
                value: 0,
                offset: 1,
                ..
            }
        ));
        assert!(err.to_string().starts_with("letters-labels: "));
    }

    #[test]
    fn shift_past_the_alphabet_is_rejected() {
        let raw = array![27u8, 1];

        let err = shift_labels(&raw.view(), 1, 26, "letters-labels").unwrap_err();

        assert!(matches!(
            err,
            DatasetError::LabelOutOfAlphabet {
                index: 0,
                value: 27,
                offset: 1,
                num_classes: 26,
                ..
            }
        ));
        let message = err.to_string();
        assert!(message.contains("letters-labels"));
        assert!(message.contains("shifted by 1"));
        assert!(message.contains("26 classes"));
    }

    proptest! {
        #[test]
        fn image_shape_follows_header(count in 0u32..6, rows in 0u32..6, cols in 0u32..6, seed in any::<u8>()) {
            let len = (count * rows * cols) as usize;
            let payload: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_add(seed)).collect();
            let header = ImagesHeader { magic: IMAGES_MAGIC, count, rows, cols };

            let (images, decoded) = read_images(&mut Cursor::new(encode_images(header, &payload)), "images").unwrap();

            prop_assert_eq!(images.shape(), &[count as usize, rows as usize, cols as usize]);
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(images, Array::from_shape_vec((count as usize, rows as usize, cols as usize), payload).unwrap());
        }

        #[test]
        fn label_count_follows_header(labels in proptest::collection::vec(any::<u8>(), 0..64)) {
            let header = LabelsHeader { magic: LABELS_MAGIC, count: labels.len() as u32 };

            let (decoded, decoded_header) = read_labels(&mut Cursor::new(encode_labels(header, &labels)), "labels").unwrap();

            prop_assert_eq!(decoded.len(), decoded_header.count as usize);
            prop_assert_eq!(decoded.to_vec(), labels);
        }
    }
}
