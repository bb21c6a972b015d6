//! Disjoint-set forest over image ids.
//!
//! Ids are remapped to dense indices on first sight; `parent` and `rank`
//! are plain arrays indexed by those, so the forest holds no pointers.

use std::collections::HashMap;

use uuid::Uuid;

#[derive(Debug, Default)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
    index: HashMap<Uuid, usize>,
    ids: Vec<Uuid>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            parent: Vec::with_capacity(n),
            rank: Vec::with_capacity(n),
            index: HashMap::with_capacity(n),
            ids: Vec::with_capacity(n),
        }
    }

    /// Number of distinct ids seen.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Dense index of `id`, allocating a singleton set on first sight.
    pub fn index_of(&mut self, id: Uuid) -> usize {
        if let Some(&i) = self.index.get(&id) {
            return i;
        }
        let i = self.ids.len();
        self.index.insert(id, i);
        self.ids.push(id);
        self.parent.push(i);
        self.rank.push(0);
        i
    }

    /// Root of the set containing index `i`, halving the path on the way.
    pub fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Merge the sets of `a` and `b`. Returns false when already joined.
    pub fn union(&mut self, a: Uuid, b: Uuid) -> bool {
        let (ia, ib) = (self.index_of(a), self.index_of(b));
        let (ra, rb) = (self.find(ia), self.find(ib));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    /// Whether `a` and `b` are in the same set. Unknown ids are in none.
    pub fn connected(&mut self, a: Uuid, b: Uuid) -> bool {
        match (self.index.get(&a).copied(), self.index.get(&b).copied()) {
            (Some(ia), Some(ib)) => self.find(ia) == self.find(ib),
            _ => false,
        }
    }

    /// Root id of the set containing `id`, if known.
    pub fn root_of(&mut self, id: Uuid) -> Option<Uuid> {
        let i = *self.index.get(&id)?;
        let root = self.find(i);
        Some(self.ids[root])
    }

    /// All sets, members sorted, sets ordered by their smallest member.
    pub fn components(&mut self) -> Vec<Vec<Uuid>> {
        let mut by_root: HashMap<usize, Vec<Uuid>> = HashMap::new();
        for i in 0..self.ids.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(self.ids[i]);
        }
        let mut components: Vec<Vec<Uuid>> = by_root
            .into_values()
            .map(|mut members| {
                members.sort();
                members
            })
            .collect();
        components.sort_by(|a, b| a[0].cmp(&b[0]));
        components
    }
}
