//! Interaction containers and the train/test dataset used by the training loop.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv;
use failure;
use rand::Rng;

use super::{ItemId, Timestamp, UserId};
use sampling::seeded_rng;

/// A single observed `(user, item)` interaction.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    timestamp: Timestamp,
}

impl Interaction {
    /// Create a new interaction.
    pub fn new(user_id: UserId, item_id: ItemId, timestamp: Timestamp) -> Self {
        Interaction {
            user_id,
            item_id,
            timestamp,
        }
    }
}

impl Interaction {
    /// The user id.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
    /// The item id.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }
    /// The timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Randomly split interactions into a train and a test set, assigning
/// each interaction independently.
pub fn train_test_split<R: Rng>(
    interactions: &mut Interactions,
    rng: &mut R,
    test_fraction: f32,
) -> (Interactions, Interactions) {
    interactions.shuffle(rng);

    let (test, train) = interactions.split_at((test_fraction * interactions.len() as f32) as usize);

    (train, test)
}

/// A flat collection of interactions over a fixed id space.
#[derive(Clone, Debug)]
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Create an empty collection over `num_users` users and `num_items` items.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users: num_users,
            num_items: num_items,
            interactions: Vec::new(),
        }
    }

    /// Read `user_id,item_id,timestamp` records from a CSV file with a header.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let mut reader = csv::Reader::from_path(path)?;
        let interactions: Vec<Interaction> =
            reader.deserialize().collect::<Result<Vec<_>, _>>()?;

        Ok(Interactions::from(interactions))
    }

    /// Read a whitespace-separated adjacency list file.
    ///
    /// Every line starts with a user id followed by the ids of the items
    /// that user interacted with. Lines with a user but no items are skipped.
    pub fn from_adjacency_file<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut interactions = Vec::new();

        for (line_number, line) in reader.lines().enumerate() {
            let line = line?;
            let ids = line
                .split_whitespace()
                .map(|token| token.parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|error| {
                    format_err!(
                        "{}:{}: invalid id ({})",
                        path.display(),
                        line_number + 1,
                        error
                    )
                })?;

            if ids.len() < 2 {
                continue;
            }

            let user_id = ids[0];
            interactions.extend(
                ids[1..]
                    .iter()
                    .map(|&item_id| Interaction::new(user_id, item_id, line_number)),
            );
        }

        Ok(Interactions::from(interactions))
    }

    /// The raw interactions.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Add an interaction, growing the id space if necessary.
    pub fn push(&mut self, interaction: Interaction) {
        self.num_users = self.num_users.max(interaction.user_id() + 1);
        self.num_items = self.num_items.max(interaction.item_id() + 1);
        self.interactions.push(interaction);
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Shuffle the interactions in place.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        rng.shuffle(&mut self.interactions);
    }

    /// Split into the first `idx` interactions and the rest.
    pub fn split_at(&self, idx: usize) -> (Self, Self) {
        let head = Interactions {
            num_users: self.num_users,
            num_items: self.num_items,
            interactions: self.interactions[..idx].to_owned(),
        };
        let tail = Interactions {
            num_users: self.num_users,
            num_items: self.num_items,
            interactions: self.interactions[idx..].to_owned(),
        };

        (head, tail)
    }

    /// Convert to the per-user compressed representation.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        let num_users = data.iter().map(|x| x.user_id() + 1).max().unwrap_or(0);
        let num_items = data.iter().map(|x| x.item_id() + 1).max().unwrap_or(0);

        Interactions {
            num_users: num_users,
            num_items: num_items,
            interactions: data,
        }
    }
}

/// Per-user item sets in compressed sparse row layout.
///
/// The items of every user are sorted and deduplicated, so membership
/// tests are binary searches.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        CompressedInteractions::with_shape(
            interactions,
            interactions.num_users,
            interactions.num_items,
        )
    }
}

impl CompressedInteractions {
    /// Compress `interactions` into an id space of at least
    /// `num_users` by `num_items`.
    pub fn with_shape(
        interactions: &Interactions,
        num_users: usize,
        num_items: usize,
    ) -> CompressedInteractions {
        let num_users = num_users.max(interactions.num_users);
        let num_items = num_items.max(interactions.num_items);

        let mut pairs: Vec<(UserId, ItemId)> = interactions
            .data()
            .iter()
            .map(|x| (x.user_id(), x.item_id()))
            .collect();
        pairs.sort();
        pairs.dedup();

        let mut user_pointers = vec![0; num_users + 1];
        let mut item_ids = Vec::with_capacity(pairs.len());

        for &(user_id, item_id) in &pairs {
            item_ids.push(item_id);
            user_pointers[user_id + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedInteractions {
            num_users: num_users,
            num_items: num_items,
            user_pointers: user_pointers,
            item_ids: item_ids,
        }
    }

    /// Iterate over all users, including those without interactions.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator {
        CompressedInteractionsUserIterator {
            interactions: &self,
            idx: 0,
        }
    }

    /// The sorted items of `user_id`; empty for unknown users.
    pub fn items(&self, user_id: UserId) -> &[ItemId] {
        if user_id >= self.num_users {
            return &[];
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        &self.item_ids[start..stop]
    }

    /// Whether `user_id` interacted with `item_id`.
    pub fn contains(&self, user_id: UserId, item_id: ItemId) -> bool {
        self.items(user_id).binary_search(&item_id).is_ok()
    }

    /// Total number of distinct `(user, item)` pairs.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

/// Iterator over the users of a [`CompressedInteractions`].
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// The interactions of a single user.
#[derive(Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// The user.
    pub user_id: UserId,
    /// The user's sorted, distinct items.
    pub item_ids: &'a [ItemId],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Whether the user has no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = if self.idx >= self.interactions.num_users {
            None
        } else {
            Some(CompressedInteractionsUser {
                user_id: self.idx,
                item_ids: self.interactions.items(self.idx),
            })
        };

        self.idx += 1;

        value
    }
}

/// Train and test interaction sets over a shared id space.
#[derive(Clone, Debug)]
pub struct Dataset {
    train: CompressedInteractions,
    test: CompressedInteractions,
}

impl Dataset {
    /// Build a dataset from train and test interactions. The id space is
    /// the union of both.
    pub fn new(train: &Interactions, test: &Interactions) -> Self {
        let num_users = train.num_users().max(test.num_users());
        let num_items = train.num_items().max(test.num_items());

        Dataset {
            train: CompressedInteractions::with_shape(train, num_users, num_items),
            test: CompressedInteractions::with_shape(test, num_users, num_items),
        }
    }

    /// Split `interactions` at random, `test_fraction` of them going to
    /// the test set.
    pub fn from_split(interactions: &mut Interactions, test_fraction: f32, seed: u64) -> Self {
        let (train, test) = train_test_split(interactions, &mut seeded_rng(seed, 0), test_fraction);
        Dataset::new(&train, &test)
    }

    /// Load a `user_id,item_id,timestamp` CSV file and split it at random.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        test_fraction: f32,
        seed: u64,
    ) -> Result<Self, failure::Error> {
        let mut interactions = Interactions::from_csv(path)?;
        let dataset = Dataset::from_split(&mut interactions, test_fraction, seed);

        info!(
            "Loaded {} users, {} items, {} train and {} test interactions.",
            dataset.num_users(),
            dataset.num_items(),
            dataset.train.len(),
            dataset.test.len()
        );

        Ok(dataset)
    }

    /// Load `train.txt` and `test.txt` adjacency lists from `dir`.
    pub fn from_adjacency_dir<P: AsRef<Path>>(dir: P) -> Result<Self, failure::Error> {
        let dir = dir.as_ref();
        Dataset::from_adjacency_files(dir.join("train.txt"), dir.join("test.txt"))
    }

    /// Load train and test adjacency list files.
    pub fn from_adjacency_files<P: AsRef<Path>, Q: AsRef<Path>>(
        train: P,
        test: Q,
    ) -> Result<Self, failure::Error> {
        let train = Interactions::from_adjacency_file(train)?;
        let test = Interactions::from_adjacency_file(test)?;

        let dataset = Dataset::new(&train, &test);

        info!(
            "Loaded {} users, {} items, {} train and {} test interactions.",
            dataset.num_users(),
            dataset.num_items(),
            dataset.train.len(),
            dataset.test.len()
        );

        Ok(dataset)
    }

    /// Training interactions.
    pub fn train(&self) -> &CompressedInteractions {
        &self.train
    }

    /// Test interactions.
    pub fn test(&self) -> &CompressedInteractions {
        &self.test
    }

    /// Sorted training items of `user_id`.
    pub fn train_items(&self, user_id: UserId) -> &[ItemId] {
        self.train.items(user_id)
    }

    /// Sorted test items of `user_id`.
    pub fn test_items(&self, user_id: UserId) -> &[ItemId] {
        self.test.items(user_id)
    }

    /// Users with at least one test interaction, in ascending order.
    pub fn users_with_test(&self) -> Vec<UserId> {
        self.test
            .iter_users()
            .filter(|user| !user.is_empty())
            .map(|user| user.user_id)
            .collect()
    }

    /// Number of distinct training interactions.
    pub fn num_train_interactions(&self) -> usize {
        self.train.len()
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.train.num_users()
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.train.num_items()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rand::{SeedableRng, XorShiftRng};
    use tempfile;

    use super::*;

    fn interactions(pairs: &[(UserId, ItemId)]) -> Interactions {
        Interactions::from(
            pairs
                .iter()
                .enumerate()
                .map(|(i, &(user, item))| Interaction::new(user, item, i))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn compressed_items_are_sorted_and_distinct() {
        let data = interactions(&[(1, 5), (0, 3), (1, 2), (1, 5), (0, 1)]);
        let compressed = data.to_compressed();

        assert_eq!(compressed.shape(), (2, 6));
        assert_eq!(compressed.items(0), &[1, 3]);
        assert_eq!(compressed.items(1), &[2, 5]);
        assert_eq!(compressed.items(7), &[] as &[ItemId]);
        assert_eq!(compressed.len(), 4);
        assert!(compressed.contains(1, 5));
        assert!(!compressed.contains(0, 5));
    }

    #[test]
    fn dataset_shares_id_space() {
        let train = interactions(&[(0, 1), (1, 2)]);
        let test = interactions(&[(2, 7)]);
        let dataset = Dataset::new(&train, &test);

        assert_eq!(dataset.num_users(), 3);
        assert_eq!(dataset.num_items(), 8);
        assert_eq!(dataset.test().shape(), dataset.train().shape());
        assert_eq!(dataset.users_with_test(), vec![2]);
        assert_eq!(dataset.train_items(2), &[] as &[ItemId]);
    }

    #[test]
    fn split_keeps_every_interaction() {
        let mut data = interactions(&[(0, 1), (0, 2), (1, 2), (1, 3), (2, 0)]);
        let mut rng = XorShiftRng::from_seed([42; 16]);

        let (train, test) = train_test_split(&mut data, &mut rng, 0.4);

        assert_eq!(test.len(), 2);
        assert_eq!(train.len(), 3);
        assert_eq!(train.shape(), test.shape());
    }

    #[test]
    fn seeded_split_is_reproducible() {
        let pairs: Vec<_> = (0..50).map(|idx| (idx % 7, idx % 11)).collect();

        let first = Dataset::from_split(&mut interactions(&pairs), 0.2, 5);
        let second = Dataset::from_split(&mut interactions(&pairs), 0.2, 5);

        assert_eq!(first.test().len(), second.test().len());
        for user_id in 0..first.num_users() {
            assert_eq!(first.test_items(user_id), second.test_items(user_id));
            assert_eq!(first.train_items(user_id), second.train_items(user_id));
        }
    }

    #[test]
    fn reads_adjacency_lists() {
        let dir = tempfile::tempdir().unwrap();

        let mut train = File::create(dir.path().join("train.txt")).unwrap();
        writeln!(train, "0 1 2 3").unwrap();
        writeln!(train, "1 0").unwrap();
        writeln!(train, "2").unwrap();
        let mut test = File::create(dir.path().join("test.txt")).unwrap();
        writeln!(test, "0 4").unwrap();
        writeln!(test, "2 1 1").unwrap();

        let dataset = Dataset::from_adjacency_dir(dir.path()).unwrap();

        assert_eq!(dataset.num_users(), 3);
        assert_eq!(dataset.num_items(), 5);
        assert_eq!(dataset.num_train_interactions(), 4);
        assert_eq!(dataset.train_items(0), &[1, 2, 3]);
        assert_eq!(dataset.test_items(2), &[1]);
        assert_eq!(dataset.users_with_test(), vec![0, 2]);
    }

    #[test]
    fn rejects_malformed_adjacency_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "0 1 x").unwrap();

        assert!(Interactions::from_adjacency_file(&path).is_err());
    }

    #[test]
    fn reads_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "user_id,item_id,timestamp").unwrap();
        writeln!(file, "0,3,10").unwrap();
        writeln!(file, "2,1,11").unwrap();

        let data = Interactions::from_csv(&path).unwrap();

        assert_eq!(data.shape(), (3, 4));
        assert_eq!(data.data()[1], Interaction::new(2, 1, 11));
    }
}
