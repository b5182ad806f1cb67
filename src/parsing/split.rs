use super::Dataset;
use crate::error::DatasetError;
use ndarray::ArrayView1;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;

/// Proportions of the train/validation/test partitions
#[derive(Debug, Clone, Copy)]
pub struct SplitRatios {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        SplitRatios {
            train: 0.8,
            validation: 0.1,
            test: 0.1,
        }
    }
}

impl SplitRatios {
    fn validate(&self) -> Result<(), DatasetError> {
        for ratio in [self.train, self.validation, self.test] {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(DatasetError::InvalidFraction(ratio));
            }
        }

        let total = self.train + self.validation + self.test;
        if (total - 1.0).abs() > 1e-6 {
            return Err(DatasetError::InvalidFraction(total));
        }

        Ok(())
    }
}

/// Record indices of each partition
#[derive(Debug, Clone)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

pub struct Split {
    pub train: Dataset,
    pub validation: Dataset,
    pub test: Dataset,
}

/// Partition `dataset` into stratified train/validation/test subsets
pub fn train_val_test_split<R: Rng + ?Sized>(
    dataset: &Dataset,
    ratios: SplitRatios,
    rng: &mut R,
) -> Result<Split, DatasetError> {
    let indices = split_indices(&dataset.labels.view(), ratios, rng)?;

    tracing::info!(
        train = indices.train.len(),
        validation = indices.validation.len(),
        test = indices.test.len(),
        "stratified split"
    );

    Ok(Split {
        train: dataset.select(&indices.train),
        validation: dataset.select(&indices.validation),
        test: dataset.select(&indices.test),
    })
}

/// Three-way stratified split over a label vector.
/// The test partition is carved first, then the validation partition out of what is left,
/// with the second fraction rescaled so both end up at their share of the whole.
pub fn split_indices<R: Rng + ?Sized>(
    labels: &ArrayView1<u8>,
    ratios: SplitRatios,
    rng: &mut R,
) -> Result<SplitIndices, DatasetError> {
    ratios.validate()?;
    require_members(&group_by_class(labels), 3)?;

    // two records of every class stay behind for the validation split
    let (remaining, test) = split_keeping(labels, ratios.test, 2, rng)?;

    let remaining_labels: Vec<u8> = remaining.iter().map(|&i| labels[i]).collect();
    let validation_fraction = ratios.validation / (ratios.train + ratios.validation);
    let (train_local, validation_local) =
        stratified_split(&ArrayView1::from(&remaining_labels), validation_fraction, rng)?;

    Ok(SplitIndices {
        train: train_local.iter().map(|&i| remaining[i]).collect(),
        validation: validation_local.iter().map(|&i| remaining[i]).collect(),
        test,
    })
}

/// Split indices into (remaining, test) so that both keep the class frequencies of `labels`.
/// The test partition holds ceil(n * test_fraction) records.
pub fn stratified_split<R: Rng + ?Sized>(
    labels: &ArrayView1<u8>,
    test_fraction: f64,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<usize>), DatasetError> {
    split_keeping(labels, test_fraction, 1, rng)
}

/// Stratified split that leaves at least `keep` records of every class in the remainder
fn split_keeping<R: Rng + ?Sized>(
    labels: &ArrayView1<u8>,
    test_fraction: f64,
    keep: usize,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<usize>), DatasetError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(DatasetError::InvalidFraction(test_fraction));
    }

    let n = labels.len();
    if n == 0 {
        return Ok((vec![], vec![]));
    }

    let classes = group_by_class(labels);
    require_members(&classes, keep + 1)?;

    let capacity: usize = classes.values().map(|members| members.len() - keep).sum();
    // the epsilon keeps float noise in n * fraction from bumping an exact product up
    let n_test = ((n as f64 * test_fraction - 1e-9).ceil() as usize).clamp(1, capacity);
    let allocation = allocate(&classes, n, n_test, keep, rng);

    let mut remaining = Vec::with_capacity(n - n_test);
    let mut test = Vec::with_capacity(n_test);
    for ((_, members), take) in classes.into_iter().zip(allocation) {
        let mut members = members;
        members.shuffle(rng);
        test.extend_from_slice(&members[..take]);
        remaining.extend_from_slice(&members[take..]);
    }

    remaining.shuffle(rng);
    test.shuffle(rng);

    Ok((remaining, test))
}

fn group_by_class(labels: &ArrayView1<u8>) -> BTreeMap<u8, Vec<usize>> {
    let mut classes: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (index, &label) in labels.iter().enumerate() {
        classes.entry(label).or_default().push(index);
    }

    classes
}

fn require_members(
    classes: &BTreeMap<u8, Vec<usize>>,
    required: usize,
) -> Result<(), DatasetError> {
    match classes
        .iter()
        .find(|(_, members)| members.len() < required)
    {
        Some((&class, members)) => Err(DatasetError::ClassImbalance {
            class,
            count: members.len(),
            required,
        }),
        None => Ok(()),
    }
}

/// Number of test records per class (same order as `classes`).
/// Each class gets the floor of its proportional share; the records left over go to the
/// classes with the largest fractional part, ties broken at random. At least `keep` records
/// of every class stay out of the test partition.
fn allocate<R: Rng + ?Sized>(
    classes: &BTreeMap<u8, Vec<usize>>,
    n: usize,
    n_test: usize,
    keep: usize,
    rng: &mut R,
) -> Vec<usize> {
    let sizes: Vec<usize> = classes.values().map(Vec::len).collect();
    let shares: Vec<f64> = sizes
        .iter()
        .map(|&size| size as f64 * n_test as f64 / n as f64)
        .collect();
    let mut allocation: Vec<usize> = shares
        .iter()
        .zip(&sizes)
        .map(|(share, &size)| (share.floor() as usize).min(size - keep))
        .collect();

    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.shuffle(rng);
    // stable sort keeps the shuffled order among equal remainders
    order.sort_by(|&a, &b| {
        let rem_a = shares[a] - shares[a].floor();
        let rem_b = shares[b] - shares[b].floor();
        rem_b.total_cmp(&rem_a)
    });

    let mut leftover = n_test.saturating_sub(allocation.iter().sum());
    for class in order {
        if leftover == 0 {
            break;
        }
        if allocation[class] + keep < sizes[class] {
            allocation[class] += 1;
            leftover -= 1;
        }
    }

    allocation
}
