//! Spatial clustering of duplicate sets into optical duplicate clusters.
//!
//! Members of a duplicate set are grouped by read group and tile, bucketed into a grid whose cell
//! size equals the pixel distance, and linked whenever two members in neighbouring cells lie within
//! the distance. Connected components are found with union-find; every component keeps exactly one
//! member unflagged.

use ahash::AHashMap;
use clap::ValueEnum;
use log::{debug, info};

use super::location::PhysicalLocation;

/// Default maximum pixel distance between optical duplicates.
pub const DEFAULT_OPTICAL_PIXEL_DISTANCE: u32 = 100;

/// Sets larger than this are skipped entirely.
pub const DEFAULT_MAX_SET_SIZE: usize = 300_000;

/// Sets larger than this log their progress.
pub const DEFAULT_BIG_SET_SIZE: usize = 1_000;

/// How the distance between two locations is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DistanceMetric {
    /// Straight-line distance.
    #[default]
    Euclidean,
    /// Largest per-axis distance (a square box around each read).
    Chebyshev,
}

impl DistanceMetric {
    fn within(self, a: &PhysicalLocation, b: &PhysicalLocation, distance: i64) -> bool {
        let dx = (i64::from(a.x) - i64::from(b.x)).abs();
        let dy = (i64::from(a.y) - i64::from(b.y)).abs();
        match self {
            DistanceMetric::Euclidean => dx * dx + dy * dy <= distance * distance,
            DistanceMetric::Chebyshev => dx <= distance && dy <= distance,
        }
    }
}

/// Disjoint-set forest with path halving and union by size.
#[derive(Debug)]
pub struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), size: vec![1; n] }
    }

    /// The representative of `i`'s component.
    pub fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Merges the components of `a` and `b`.
    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[small] = big;
        self.size[big] += self.size[small];
    }
}

/// Finds optical duplicates within duplicate sets.
#[derive(Debug, Clone)]
pub struct OpticalDuplicateFinder {
    pub pixel_distance: u32,
    pub metric: DistanceMetric,
    pub max_set_size: usize,
    pub big_set_size: usize,
}

impl Default for OpticalDuplicateFinder {
    fn default() -> Self {
        Self {
            pixel_distance: DEFAULT_OPTICAL_PIXEL_DISTANCE,
            metric: DistanceMetric::default(),
            max_set_size: DEFAULT_MAX_SET_SIZE,
            big_set_size: DEFAULT_BIG_SET_SIZE,
        }
    }
}

impl OpticalDuplicateFinder {
    #[must_use]
    pub fn new(pixel_distance: u32, metric: DistanceMetric, max_set_size: usize) -> Self {
        Self { pixel_distance, metric, max_set_size, ..Self::default() }
    }

    /// Flags the optical duplicates in one duplicate set.
    ///
    /// `locations` and `scores` are parallel; `keeper` is the index of the set's representative, if
    /// it belongs to this list. The keeper is never flagged and anchors its own cluster; in every
    /// other cluster the highest-scoring member (ties: smaller x, then smaller y, then earlier index)
    /// stays unflagged. Members without a location are never flagged.
    #[must_use]
    pub fn find_optical_duplicates(
        &self,
        locations: &[Option<PhysicalLocation>],
        scores: &[u32],
        keeper: Option<usize>,
    ) -> Vec<bool> {
        let n = locations.len();
        let mut flags = vec![false; n];
        if n < 2 || n > self.max_set_size {
            return flags;
        }

        let keeper = keeper.filter(|&k| k < n && locations[k].is_some());
        let log_progress = n > self.big_set_size;
        if log_progress {
            info!("Large duplicate set: size = {n}");
        }

        let mut tiles: AHashMap<(u16, i32), Vec<usize>> = AHashMap::new();
        for (i, loc) in locations.iter().enumerate() {
            if let Some(loc) = loc {
                tiles.entry((loc.read_group, loc.tile)).or_default().push(i);
            }
        }

        let mut clusters = UnionFind::new(n);
        for members in tiles.values().filter(|m| m.len() > 1) {
            self.link_tile(locations, members, &mut clusters);
        }
        if log_progress {
            debug!("Built optical adjacency for {n} reads in {} tile groups", tiles.len());
        }

        let keeper_root = keeper.map(|k| clusters.find(k));
        let mut best: AHashMap<usize, usize> = AHashMap::new();
        for i in (0..n).filter(|&i| locations[i].is_some()) {
            let root = clusters.find(i);
            if keeper_root == Some(root) {
                continue;
            }
            best.entry(root)
                .and_modify(|b| {
                    if Self::outranks(i, *b, locations, scores) {
                        *b = i;
                    }
                })
                .or_insert(i);
        }

        for i in (0..n).filter(|&i| locations[i].is_some()) {
            let root = clusters.find(i);
            flags[i] = match keeper_root {
                Some(kr) if kr == root => Some(i) != keeper,
                _ => best.get(&root) != Some(&i),
            };
        }
        flags
    }

    /// True if member `a` should be kept over member `b`.
    fn outranks(
        a: usize,
        b: usize,
        locations: &[Option<PhysicalLocation>],
        scores: &[u32],
    ) -> bool {
        let score = |i: usize| scores.get(i).copied().unwrap_or(0);
        let xy = |i: usize| locations[i].map_or((i32::MAX, i32::MAX), |l| (l.x, l.y));
        match score(a).cmp(&score(b)) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => (xy(a), a) < (xy(b), b),
        }
    }

    /// Unions every pair of members of one tile that lie within the pixel distance.
    fn link_tile(
        &self,
        locations: &[Option<PhysicalLocation>],
        members: &[usize],
        clusters: &mut UnionFind,
    ) {
        let distance = i64::from(self.pixel_distance);
        let cell_size = distance.max(1);
        let cell_of = |loc: &PhysicalLocation| {
            (i64::from(loc.x).div_euclid(cell_size), i64::from(loc.y).div_euclid(cell_size))
        };

        let mut grid: AHashMap<(i64, i64), Vec<usize>> = AHashMap::new();
        for &i in members {
            if let Some(loc) = &locations[i] {
                grid.entry(cell_of(loc)).or_default().push(i);
            }
        }

        for &i in members {
            let Some(loc) = &locations[i] else { continue };
            let (cx, cy) = cell_of(loc);
            for dx in -1..=1 {
                for dy in -1..=1 {
                    let Some(neighbours) = grid.get(&(cx + dx, cy + dy)) else { continue };
                    for &j in neighbours.iter().filter(|&&j| j > i) {
                        if let Some(other) = &locations[j] {
                            if self.metric.within(loc, other, distance) {
                                clusters.union(i, j);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Counts the flagged members.
    #[must_use]
    pub fn count(flags: &[bool]) -> usize {
        flags.iter().filter(|&&f| f).count()
    }
}
