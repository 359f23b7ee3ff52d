//! Training batches and negative sampling.
use rand::distributions::{Distribution, Uniform};
use rand::{seq, Rng, SeedableRng, XorShiftRng};

use data::Dataset;
use {ItemId, UserId};

/// Build a generator for stream `stream` of `seed`.
pub fn seeded_rng(seed: u64, stream: u64) -> XorShiftRng {
    XorShiftRng::seed_from_u64(seed ^ stream.wrapping_mul(0xD1B5_4A32_D192_ED03))
}

/// Draw an item uniformly from `[0, num_items)` that is not in `excluded`.
///
/// `excluded` must be sorted. Returns `None` when every item is excluded.
pub fn sample_negative<R: Rng>(
    excluded: &[ItemId],
    item_range: &Uniform<usize>,
    num_items: usize,
    rng: &mut R,
) -> Option<ItemId> {
    if excluded.len() >= num_items {
        return None;
    }

    loop {
        let candidate = item_range.sample(rng);

        if excluded.binary_search(&candidate).is_err() {
            return Some(candidate);
        }
    }
}

/// Draw up to `num_negatives` distinct items from `[0, num_items)` that are
/// in neither `train` nor `test` (both sorted).
///
/// When fewer items are available, all of them are returned.
pub fn sample_evaluation_negatives<R: Rng>(
    num_items: usize,
    train: &[ItemId],
    test: &[ItemId],
    num_negatives: usize,
    rng: &mut R,
) -> Vec<ItemId> {
    let pool: Vec<ItemId> = (0..num_items)
        .filter(|item| train.binary_search(item).is_err() && test.binary_search(item).is_err())
        .collect();

    if num_negatives >= pool.len() {
        return pool;
    }

    seq::sample_indices(rng, pool.len(), num_negatives)
        .into_iter()
        .map(|idx| pool[idx])
        .collect()
}

/// A batch of `(user, positive item, negative item)` triples.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    /// Users.
    pub user_ids: Vec<UserId>,
    /// Observed items.
    pub positive_item_ids: Vec<ItemId>,
    /// Sampled unobserved items.
    pub negative_item_ids: Vec<ItemId>,
}

impl Batch {
    /// Number of triples.
    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    /// Whether the batch holds no triples.
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }
}

/// Produces shuffled passes over the training interactions of a dataset.
pub struct BatchSampler<'a> {
    dataset: &'a Dataset,
    pairs: Vec<(UserId, ItemId)>,
    item_range: Option<Uniform<usize>>,
    rng: XorShiftRng,
}

impl<'a> BatchSampler<'a> {
    /// Build a sampler over the training interactions of `dataset`.
    pub fn new(dataset: &'a Dataset, rng: XorShiftRng) -> Self {
        let pairs = dataset
            .train()
            .iter_users()
            .flat_map(|user| {
                let user_id = user.user_id;
                user.item_ids.iter().map(move |&item_id| (user_id, item_id))
            })
            .collect();

        let item_range = if dataset.num_items() > 0 {
            Some(Uniform::new(0, dataset.num_items()))
        } else {
            None
        };

        BatchSampler {
            dataset: dataset,
            pairs: pairs,
            item_range: item_range,
            rng: rng,
        }
    }

    /// Number of training interactions in one pass.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether there is nothing to train on.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of batches in one pass, counting the final partial batch.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        let len = self.pairs.len();
        len / batch_size + (len % batch_size != 0) as usize
    }

    /// Shuffle the interactions and iterate over one pass of batches.
    pub fn epoch(&mut self, batch_size: usize) -> EpochBatches {
        self.rng.shuffle(&mut self.pairs);

        EpochBatches {
            dataset: self.dataset,
            pairs: &self.pairs,
            item_range: self.item_range.as_ref(),
            rng: &mut self.rng,
            batch_size: batch_size,
            idx: 0,
        }
    }
}

/// One pass over the training interactions.
pub struct EpochBatches<'a> {
    dataset: &'a Dataset,
    pairs: &'a [(UserId, ItemId)],
    item_range: Option<&'a Uniform<usize>>,
    rng: &'a mut XorShiftRng,
    batch_size: usize,
    idx: usize,
}

impl<'a> Iterator for EpochBatches<'a> {
    type Item = Batch;
    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.pairs.len() {
            return None;
        }

        let stop = self.idx + self.batch_size.min(self.pairs.len() - self.idx);
        let item_range = self.item_range?;
        let num_items = self.dataset.num_items();

        let mut batch = Batch::default();

        for &(user_id, item_id) in &self.pairs[self.idx..stop] {
            let train_items = self.dataset.train_items(user_id);

            match sample_negative(train_items, item_range, num_items, &mut *self.rng) {
                Some(negative_id) => {
                    batch.user_ids.push(user_id);
                    batch.positive_item_ids.push(item_id);
                    batch.negative_item_ids.push(negative_id);
                }
                None => debug!("User {} has no negative items to sample.", user_id),
            }
        }

        self.idx = stop;

        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::{Interaction, Interactions};

    fn dataset() -> Dataset {
        let train: Vec<_> = vec![(0, 0), (0, 1), (1, 2), (1, 3), (2, 0)]
            .into_iter()
            .map(|(user, item)| Interaction::new(user, item, 0))
            .collect();
        let test = vec![Interaction::new(0, 4, 0), Interaction::new(1, 0, 0)];

        Dataset::new(&Interactions::from(train), &Interactions::from(test))
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let draw = |seed, stream| {
            let mut rng = seeded_rng(seed, stream);
            (0..8).map(|_| rng.gen::<u32>()).collect::<Vec<_>>()
        };

        assert_eq!(draw(7, 3), draw(7, 3));
        assert_ne!(draw(7, 3), draw(7, 4));
        assert_ne!(draw(7, 3), draw(8, 3));
    }

    #[test]
    fn negatives_avoid_train_items() {
        let mut rng = seeded_rng(1, 0);
        let range = Uniform::new(0, 10);
        let excluded = [1, 2, 3, 5, 8];

        for _ in 0..1000 {
            let negative = sample_negative(&excluded, &range, 10, &mut rng).unwrap();
            assert!(excluded.binary_search(&negative).is_err());
        }
    }

    #[test]
    fn no_negative_when_everything_is_excluded() {
        let mut rng = seeded_rng(1, 0);
        let range = Uniform::new(0, 3);

        assert_eq!(sample_negative(&[0, 1, 2], &range, 3, &mut rng), None);
    }

    #[test]
    fn evaluation_negatives_are_distinct_and_unseen() {
        let mut rng = seeded_rng(5, 0);
        let train = [0, 2, 4];
        let test = [1, 9];

        let negatives = sample_evaluation_negatives(20, &train, &test, 6, &mut rng);

        assert_eq!(negatives.len(), 6);

        let mut sorted = negatives.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 6);

        for negative in negatives {
            assert!(negative < 20);
            assert!(!train.contains(&negative));
            assert!(!test.contains(&negative));
        }
    }

    #[test]
    fn evaluation_negatives_are_clipped() {
        let mut rng = seeded_rng(5, 0);

        let negatives = sample_evaluation_negatives(5, &[0, 1], &[2], 100, &mut rng);

        assert_eq!(negatives, vec![3, 4]);
    }

    #[test]
    fn evaluation_negatives_depend_only_on_the_seed() {
        let first = sample_evaluation_negatives(100, &[3], &[7], 10, &mut seeded_rng(9, 2));
        let second = sample_evaluation_negatives(100, &[3], &[7], 10, &mut seeded_rng(9, 2));

        assert_eq!(first, second);
    }

    #[test]
    fn epoch_covers_every_interaction_once() {
        let dataset = dataset();
        let mut sampler = BatchSampler::new(&dataset, seeded_rng(0, 0));

        assert_eq!(sampler.len(), 5);
        assert_eq!(sampler.num_batches(2), 3);

        let batches: Vec<_> = sampler.epoch(2).collect();
        assert_eq!(
            batches.iter().map(|batch| batch.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );

        let mut seen: Vec<_> = batches
            .iter()
            .flat_map(|batch| {
                batch
                    .user_ids
                    .iter()
                    .cloned()
                    .zip(batch.positive_item_ids.iter().cloned())
            })
            .collect();
        seen.sort();
        assert_eq!(seen, vec![(0, 0), (0, 1), (1, 2), (1, 3), (2, 0)]);

        for batch in &batches {
            for (&user, &negative) in batch.user_ids.iter().zip(&batch.negative_item_ids) {
                assert!(!dataset.train().contains(user, negative));
            }
        }
    }

    #[test]
    fn huge_batch_size_gives_a_single_batch() {
        let dataset = dataset();
        let mut sampler = BatchSampler::new(&dataset, seeded_rng(0, 0));

        assert_eq!(sampler.num_batches(::std::usize::MAX), 1);
        assert_eq!(sampler.num_batches(5), 1);
        assert_eq!(sampler.num_batches(4), 2);

        let batches: Vec<_> = sampler.epoch(::std::usize::MAX).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
    }
}
