//! Adjacency-list graph over a taxonomy snapshot.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::{Taxon, TaxonGraphError, TaxonId};

/// Immutable taxonomy index built once per processing run.
///
/// # Examples
///
/// ```
/// use biota_core::{Taxon, TaxonGraph};
///
/// let graph = TaxonGraph::build(vec![
///     Taxon::new(1, "Biota"),
///     Taxon::new(2, "Aves").with_primary_parent(1),
///     Taxon::new(3, "Laridae").with_primary_parent(2),
/// ])?;
///
/// let below_aves = graph.get_descendants(2, false)?;
/// assert_eq!(below_aves.into_iter().collect::<Vec<_>>(), vec![2, 3]);
/// # Ok::<(), biota_core::TaxonGraphError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TaxonGraph {
    taxa: HashMap<TaxonId, Taxon>,
    root_id: TaxonId,
    primary_children: HashMap<TaxonId, Vec<TaxonId>>,
    secondary_children: HashMap<TaxonId, Vec<TaxonId>>,
}

impl TaxonGraph {
    /// Index a full taxonomy snapshot.
    ///
    /// Secondary parents that repeat, or that duplicate the primary parent,
    /// are collapsed. The primary edges must form a single tree.
    ///
    /// # Errors
    ///
    /// Returns [`TaxonGraphError::DuplicateTaxon`],
    /// [`TaxonGraphError::DanglingParent`], [`TaxonGraphError::MissingRoot`],
    /// [`TaxonGraphError::MultipleRoots`] or
    /// [`TaxonGraphError::CycleDetected`] when the snapshot is malformed.
    pub fn build(taxa: Vec<Taxon>) -> Result<Self, TaxonGraphError> {
        let mut by_id: HashMap<TaxonId, Taxon> = HashMap::with_capacity(taxa.len());
        for mut taxon in taxa {
            if by_id.contains_key(&taxon.id) {
                return Err(TaxonGraphError::DuplicateTaxon { taxon_id: taxon.id });
            }
            normalise_secondary_parents(&mut taxon);
            by_id.insert(taxon.id, taxon);
        }

        let mut ids: Vec<TaxonId> = by_id.keys().copied().collect();
        ids.sort_unstable();

        let mut roots = Vec::new();
        let mut primary_children: HashMap<TaxonId, Vec<TaxonId>> = HashMap::new();
        let mut secondary_children: HashMap<TaxonId, Vec<TaxonId>> = HashMap::new();

        for id in &ids {
            let Some(taxon) = by_id.get(id) else { continue };
            match taxon.primary_parent_id {
                Some(parent_id) if !by_id.contains_key(&parent_id) => {
                    return Err(TaxonGraphError::DanglingParent {
                        taxon_id: *id,
                        parent_id,
                    });
                }
                Some(parent_id) => primary_children.entry(parent_id).or_default().push(*id),
                None => roots.push(*id),
            }
            for parent_id in &taxon.secondary_parent_ids {
                if !by_id.contains_key(parent_id) {
                    return Err(TaxonGraphError::DanglingParent {
                        taxon_id: *id,
                        parent_id: *parent_id,
                    });
                }
                secondary_children.entry(*parent_id).or_default().push(*id);
            }
        }

        let root_id = match roots.as_slice() {
            [] => return Err(TaxonGraphError::MissingRoot),
            [root] => *root,
            _ => return Err(TaxonGraphError::MultipleRoots { roots }),
        };

        let graph = Self {
            taxa: by_id,
            root_id,
            primary_children,
            secondary_children,
        };
        graph.ensure_primary_tree(&ids)?;
        Ok(graph)
    }

    /// Every taxon must be reachable from the root over primary edges. With a
    /// single root and no dangling parents, anything unreachable sits on or
    /// below a primary cycle.
    fn ensure_primary_tree(&self, sorted_ids: &[TaxonId]) -> Result<(), TaxonGraphError> {
        let reachable = self.primary_reachable();
        if reachable.len() == self.taxa.len() {
            return Ok(());
        }
        let Some(start) = sorted_ids.iter().find(|id| !reachable.contains(id)) else {
            return Ok(());
        };

        let mut path: Vec<TaxonId> = Vec::new();
        let mut positions: HashMap<TaxonId, usize> = HashMap::new();
        let mut current = *start;
        loop {
            if let Some(&first) = positions.get(&current) {
                let cycle = path.split_off(first);
                return Err(TaxonGraphError::CycleDetected { cycle });
            }
            positions.insert(current, path.len());
            path.push(current);
            let Some(parent) = self
                .taxa
                .get(&current)
                .and_then(|taxon| taxon.primary_parent_id)
            else {
                return Err(TaxonGraphError::CycleDetected { cycle: path });
            };
            current = parent;
        }
    }

    fn primary_reachable(&self) -> HashSet<TaxonId> {
        let mut visited = HashSet::with_capacity(self.taxa.len());
        let mut queue = VecDeque::from([self.root_id]);
        visited.insert(self.root_id);
        while let Some(current) = queue.pop_front() {
            for child in self.primary_children_of(current) {
                if visited.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        visited
    }

    /// Identifier of the single root taxon.
    pub fn root(&self) -> TaxonId {
        self.root_id
    }

    /// Look up a taxon by identifier.
    pub fn get(&self, taxon_id: TaxonId) -> Option<&Taxon> {
        self.taxa.get(&taxon_id)
    }

    /// Number of taxa in the graph.
    pub fn len(&self) -> usize {
        self.taxa.len()
    }

    /// Whether the graph holds no taxa. A built graph always has a root, so
    /// this only exists for API symmetry with [`Self::len`].
    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    /// Direct children over primary edges, ascending.
    pub fn primary_children_of(&self, taxon_id: TaxonId) -> &[TaxonId] {
        self.primary_children
            .get(&taxon_id)
            .map_or(&[], Vec::as_slice)
    }

    /// Direct children over secondary edges, ascending.
    pub fn secondary_children_of(&self, taxon_id: TaxonId) -> &[TaxonId] {
        self.secondary_children
            .get(&taxon_id)
            .map_or(&[], Vec::as_slice)
    }

    /// Collect the queried taxon and everything below it.
    ///
    /// The root is never part of the result, so querying the root returns
    /// every other taxon. Secondary children are followed only when
    /// `include_secondary` is set; each id appears once regardless of how
    /// many paths reach it.
    ///
    /// # Errors
    ///
    /// Returns [`TaxonGraphError::UnknownTaxon`] when `taxon_id` is absent.
    pub fn get_descendants(
        &self,
        taxon_id: TaxonId,
        include_secondary: bool,
    ) -> Result<BTreeSet<TaxonId>, TaxonGraphError> {
        if !self.taxa.contains_key(&taxon_id) {
            return Err(TaxonGraphError::UnknownTaxon { taxon_id });
        }

        let mut descendants = BTreeSet::new();
        let mut visited = HashSet::from([taxon_id]);
        let mut queue = VecDeque::from([taxon_id]);
        while let Some(current) = queue.pop_front() {
            if current != self.root_id {
                descendants.insert(current);
            }
            let secondary = if include_secondary {
                self.secondary_children_of(current)
            } else {
                &[]
            };
            for child in self.primary_children_of(current).iter().chain(secondary) {
                if visited.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        Ok(descendants)
    }

    /// Primary ancestors of a taxon, nearest first, ending at the root.
    ///
    /// # Errors
    ///
    /// Returns [`TaxonGraphError::UnknownTaxon`] when `taxon_id` is absent.
    pub fn ancestors(&self, taxon_id: TaxonId) -> Result<Vec<TaxonId>, TaxonGraphError> {
        let taxon = self
            .taxa
            .get(&taxon_id)
            .ok_or(TaxonGraphError::UnknownTaxon { taxon_id })?;
        let mut lineage = Vec::new();
        let mut next = taxon.primary_parent_id;
        while let Some(parent_id) = next {
            lineage.push(parent_id);
            next = self
                .taxa
                .get(&parent_id)
                .and_then(|parent| parent.primary_parent_id);
        }
        Ok(lineage)
    }

    /// Breadth-first order over primary edges; every taxon follows its
    /// primary parent.
    pub fn topological_order(&self) -> Vec<TaxonId> {
        let mut order = Vec::with_capacity(self.taxa.len());
        let mut queue = VecDeque::from([self.root_id]);
        while let Some(current) = queue.pop_front() {
            order.push(current);
            queue.extend(self.primary_children_of(current).iter().copied());
        }
        order
    }

    /// Report loops over primary and secondary edges together.
    ///
    /// Each cycle lists taxa in parent-to-child order, rotated so the lowest
    /// id comes first. A well-formed taxonomy yields an empty list; anything
    /// else points at upstream data problems in the secondary relations.
    pub fn detect_cycles(&self) -> Vec<Vec<TaxonId>> {
        let mut ids: Vec<TaxonId> = self.taxa.keys().copied().collect();
        ids.sort_unstable();

        let mut colours: HashMap<TaxonId, Colour> = HashMap::with_capacity(ids.len());
        let mut cycles = Vec::new();

        for start in ids {
            if colours.contains_key(&start) {
                continue;
            }
            let mut stack: Vec<(TaxonId, usize)> = vec![(start, 0)];
            let mut path: Vec<TaxonId> = vec![start];
            let mut on_path: HashMap<TaxonId, usize> = HashMap::from([(start, 0)]);
            colours.insert(start, Colour::Grey);

            while let Some(frame) = stack.last_mut() {
                let (node, cursor) = *frame;
                let Some(child) = self.child_at(node, cursor) else {
                    stack.pop();
                    path.pop();
                    on_path.remove(&node);
                    colours.insert(node, Colour::Black);
                    continue;
                };
                frame.1 += 1;
                match colours.get(&child) {
                    None => {
                        colours.insert(child, Colour::Grey);
                        on_path.insert(child, path.len());
                        path.push(child);
                        stack.push((child, 0));
                    }
                    Some(Colour::Grey) => {
                        if let Some(&position) = on_path.get(&child) {
                            let cycle = path.get(position..).map(<[_]>::to_vec).unwrap_or_default();
                            cycles.push(rotate_to_lowest(cycle));
                        }
                    }
                    Some(Colour::Black) => {}
                }
            }
        }
        cycles
    }

    fn child_at(&self, taxon_id: TaxonId, index: usize) -> Option<TaxonId> {
        let primary = self.primary_children_of(taxon_id);
        primary.get(index).copied().or_else(|| {
            self.secondary_children_of(taxon_id)
                .get(index.saturating_sub(primary.len()))
                .copied()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    Grey,
    Black,
}

fn normalise_secondary_parents(taxon: &mut Taxon) {
    let primary = taxon.primary_parent_id;
    taxon
        .secondary_parent_ids
        .retain(|parent_id| Some(*parent_id) != primary);
    taxon.secondary_parent_ids.sort_unstable();
    taxon.secondary_parent_ids.dedup();
}

fn rotate_to_lowest(mut cycle: Vec<TaxonId>) -> Vec<TaxonId> {
    if let Some(lowest) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(index, _)| index)
    {
        cycle.rotate_left(lowest);
    }
    cycle
}
