//! Disjoint-set forest used to join chains and friends-of-friends pairs.

/// Union-find over `0..n` with path halving.
///
/// Unions are directed: the caller decides which root survives, which lets
/// HOP keep the denser peak as the representative.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    /// `n` singleton sets.
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    /// Representative of the set containing `i`.
    pub fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Attach the set rooted at `child` under the root `parent`.
    ///
    /// Both arguments must already be roots.
    pub fn attach(&mut self, child: usize, parent: usize) {
        debug_assert_eq!(self.parent[child], child);
        debug_assert_eq!(self.parent[parent], parent);
        self.parent[child] = parent;
    }

    /// Join the sets of `a` and `b`, keeping the smaller root index.
    ///
    /// Returns `true` if they were separate.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        if ra < rb {
            self.parent[rb] = ra;
        } else {
            self.parent[ra] = rb;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_find() {
        let mut uf = UnionFind::new(5);
        assert!(uf.union(3, 4));
        assert!(uf.union(1, 4));
        assert!(!uf.union(1, 3));
        assert_eq!(uf.find(4), 1);
        assert_eq!(uf.find(0), 0);
    }

    #[test]
    fn directed_attach() {
        let mut uf = UnionFind::new(3);
        uf.attach(0, 2);
        assert_eq!(uf.find(0), 2);
    }
}
