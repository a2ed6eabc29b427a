use crate::expr::Bounds;
use crate::ir::{
    nest_block, visit_blocks_mut, Annotation, Block, BlockRef, Expr, IterKind, LoopNest, LoopRef,
    Stmt, Var,
};
use crate::scheduling::loops::take_chain_body;
use crate::scheduling::ScheduleError;

/// The part of one output dimension that a consumer subtree reads during one iteration of the
/// target loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DimRegion {
    /// A single index fixed by loops at or outside the target.
    Point(Expr),
    /// `extent` consecutive indices starting at `min`.
    Range { min: Expr, extent: u32 },
    /// The whole dimension.
    Full,
}

impl DimRegion {
    fn bounds(&self) -> Option<(&Expr, u32)> {
        match self {
            DimRegion::Point(e) => Some((e, 1)),
            DimRegion::Range { min, extent } => Some((min, *extent)),
            DimRegion::Full => None,
        }
    }

    fn union(self, other: DimRegion) -> DimRegion {
        if self == other {
            return self;
        }
        let (Some((min_a, extent_a)), Some((min_b, extent_b))) = (self.bounds(), other.bounds())
        else {
            return DimRegion::Full;
        };
        let Some(offset) = (min_b.clone() + min_a.clone() * -1).as_constant() else {
            return DimRegion::Full;
        };
        let low = offset.min(0);
        let high = (extent_a as i32).max(offset + extent_b as i32);
        DimRegion::Range {
            min: if offset < 0 { min_b.clone() } else { min_a.clone() },
            extent: (high - low) as u32,
        }
    }
}

impl LoopNest {
    /// Moves `block` inside `lp`, recomputing only the region of its output that the blocks
    /// under `lp` read in one iteration.
    ///
    /// The block must sit alone in its own loop nest, write its spatial iteration domain
    /// directly, and have every other reader of its output inside `lp`. Reduction iteration
    /// variables keep full loops. Invalidates all handles.
    pub fn compute_at(&mut self, block: &BlockRef, lp: &LoopRef) -> Result<(), ScheduleError> {
        let site = self.block_site(block)?;
        let target = self.loop_path(lp)?;
        let root = LoopNest::root_of(&site.path);
        let producer = self.block_at(&site.path).clone();
        let fail = |nest: &LoopNest, reason: String| ScheduleError::ComputeAtNotApplicable {
            block: producer.name.clone(),
            var: nest.var_name(lp.var()).to_owned(),
            reason,
        };

        if !self.is_exclusive_chain(&root) {
            return Err(fail(self, "its loops hold other statements".to_owned()));
        }
        if target == root || target.is_within(&root) {
            return Err(fail(self, "the loop encloses the block".to_owned()));
        }
        if !producer.predicates.is_empty() {
            return Err(fail(self, "the block is guarded by predicates".to_owned()));
        }
        let spatial = producer
            .iters
            .iter()
            .filter(|iv| iv.kind == IterKind::Spatial)
            .map(|iv| iv.var)
            .collect::<Vec<_>>();
        let identity_write = producer.write.indices.len() == spatial.len()
            && producer
                .write
                .indices
                .iter()
                .zip(&spatial)
                .all(|(index, var)| *index == Expr::var(*var));
        if !identity_write {
            return Err(fail(
                self,
                "the block does not write its spatial domain directly".to_owned(),
            ));
        }

        let output = producer.write.buffer;
        let mut outer = self
            .enclosing_loops(&target)
            .into_iter()
            .map(|l| l.var)
            .collect::<Vec<_>>();
        outer.push(lp.var());

        let mut regions: Vec<Option<DimRegion>> = vec![None; spatial.len()];
        let mut consumers = 0;
        for reader in self.block_sites() {
            if reader.path == site.path {
                continue;
            }
            let consumer = self.block_at(&reader.path);
            if !consumer.reads_buffer(output) {
                continue;
            }
            if !reader.path.is_within(&target) {
                return Err(fail(
                    self,
                    format!("block {} reads the output outside the loop", consumer.name),
                ));
            }
            consumers += 1;
            for access in consumer.reads.iter().filter(|r| r.buffer == output) {
                for (slot, index) in regions.iter_mut().zip(&access.indices) {
                    let region = access_region(&compose(consumer, index), &outer);
                    *slot = Some(match slot.take() {
                        Some(existing) => existing.union(region),
                        None => region,
                    });
                }
            }
        }
        if consumers == 0 {
            return Err(fail(self, "nothing inside the loop reads the output".to_owned()));
        }

        let shape = self.buffer(output).shape.clone();
        let mut new_loops = vec![];
        let mut values = vec![];
        let mut dim = 0;
        for iv in &producer.iters {
            let base = self
                .var_name(iv.var)
                .trim_start_matches('v')
                .trim_start_matches('_')
                .to_owned();
            let name = format!("{}_{base}", producer.name);
            if iv.kind == IterKind::Reduce {
                let var = self.new_var(name, iv.var.extent());
                new_loops.push(var);
                values.push(Expr::var(var));
                continue;
            }
            let full = shape[dim].get();
            let region = match regions[dim].take() {
                Some(DimRegion::Range { extent, .. }) if extent >= full => DimRegion::Full,
                Some(region) => region,
                None => DimRegion::Full,
            };
            values.push(match region {
                DimRegion::Point(e) => e,
                DimRegion::Range { min, extent } => {
                    let var = self.new_var(name, extent);
                    new_loops.push(var);
                    min + Expr::var(var)
                }
                DimRegion::Full => {
                    let var = self.new_var(name, full);
                    new_loops.push(var);
                    Expr::var(var)
                }
            });
            dim += 1;
        }

        let moved = Block { values, ..producer };
        let name = moved.name.clone();
        self.remove_stmt(&root);
        let target = self
            .find_loop(lp.var())
            .expect("the target loop lies outside the removed nest");
        self.loop_at_mut(&target)
            .body
            .insert(0, nest_block(moved, &new_loops));
        self.prune_empty();
        self.invalidate_handles();
        log::trace!(
            "computed {name} at {} under {} new loops",
            self.var_name(lp.var()),
            new_loops.len()
        );
        Ok(())
    }

    /// Moves the body of `block`'s outer loops inside `lp`, matching those loops one to one
    /// with `lp` and the loops enclosing it.
    ///
    /// No region is recomputed: the matched loops must have equal extents. Invalidates all
    /// handles.
    pub fn simple_compute_at(
        &mut self,
        block: &BlockRef,
        lp: &LoopRef,
    ) -> Result<(), ScheduleError> {
        let site = self.block_site(block)?;
        let target = self.loop_path(lp)?;
        let root = LoopNest::root_of(&site.path);
        let block_name = self.block_at(&site.path).name.clone();
        let fail = |nest: &LoopNest, reason: String| ScheduleError::ComputeAtNotApplicable {
            block: block_name.clone(),
            var: nest.var_name(lp.var()).to_owned(),
            reason,
        };

        if target == root || target.is_within(&root) {
            return Err(fail(self, "the loop encloses the block".to_owned()));
        }
        let mut chain = self
            .enclosing_loops(&target)
            .into_iter()
            .map(|l| (l.var, l.annotation))
            .collect::<Vec<_>>();
        chain.push((lp.var(), self.loop_at(&target).annotation));
        if site.loops.len() < chain.len() {
            return Err(fail(
                self,
                format!("the block has fewer than {} loops", chain.len()),
            ));
        }
        let matched = &site.loops[..chain.len()];

        let mut stmt = self.stmt(&root);
        for (depth, var) in matched.iter().enumerate() {
            let Stmt::Loop(l) = stmt else {
                unreachable!("block sites list enclosing loops");
            };
            debug_assert_eq!(l.var, *var);
            if depth + 1 < matched.len() {
                match l.body.as_slice() {
                    [only] => stmt = only,
                    _ => {
                        return Err(fail(
                            self,
                            format!("loop {} holds other statements", self.var_name(l.var)),
                        ))
                    }
                }
            } else if let Some(axis) = bound_axes(&l.body)
                .into_iter()
                .find(|axis| chain.iter().any(|(_, a)| *a == Annotation::Bound(*axis)))
            {
                let other = chain
                    .iter()
                    .find(|(_, a)| *a == Annotation::Bound(axis))
                    .map(|(v, _)| *v)
                    .expect("axis was found on the chain");
                return Err(ScheduleError::BindingConflict {
                    var: block_name.clone(),
                    axis,
                    other: self.var_name(other).to_owned(),
                });
            }
        }
        for (producer_var, (consumer_var, _)) in matched.iter().zip(&chain) {
            if producer_var.extent() != consumer_var.extent() {
                return Err(fail(
                    self,
                    format!(
                        "loop {} has extent {} but {} has extent {}",
                        self.var_name(*producer_var),
                        producer_var.extent(),
                        self.var_name(*consumer_var),
                        consumer_var.extent()
                    ),
                ));
            }
        }

        let substitutions = matched
            .iter()
            .zip(&chain)
            .map(|(p, (c, _))| (*p, Expr::var(*c)))
            .collect::<Vec<(Var, Expr)>>();
        let mut body = take_chain_body(self.remove_stmt(&root), matched.len());
        visit_blocks_mut(&mut body, &mut |b| {
            for (var, replacement) in &substitutions {
                b.substitute_loop_var(var, replacement);
            }
        });
        let target = self
            .find_loop(lp.var())
            .expect("the target loop lies outside the removed nest");
        self.loop_at_mut(&target).body.splice(0..0, body);
        self.prune_empty();
        self.invalidate_handles();
        log::trace!(
            "moved {block_name} under {} matched loops",
            substitutions.len()
        );
        Ok(())
    }
}

/// Rewrites an access index over `block`'s iteration variables into one over loop variables.
fn compose(block: &Block, index: &Expr) -> Expr {
    index.map_vars(&mut |v| match block.iters.iter().position(|iv| iv.var == *v) {
        Some(pos) => block.values[pos].clone(),
        None => Expr::var(*v),
    })
}

/// The region `index` covers while the loops in `outer` are fixed and every other loop runs
/// through its extent.
fn access_region(index: &Expr, outer: &[Var]) -> DimRegion {
    let inner = index
        .vars()
        .into_iter()
        .filter(|v| !outer.contains(v))
        .collect::<Vec<_>>();
    if inner.is_empty() {
        return DimRegion::Point(index.clone());
    }
    let mut min = index.clone();
    let mut extent = 1u32;
    for var in &inner {
        let Some(coefficient) = index.linear_coefficient(var) else {
            return DimRegion::Full;
        };
        let span = var.extent() - 1;
        let low = if coefficient < 0 { span as i32 } else { 0 };
        min = min.subs(var, &Expr::constant(low));
        extent += coefficient.unsigned_abs() * span;
    }
    DimRegion::Range { min, extent }
}

fn bound_axes(stmts: &[Stmt]) -> Vec<crate::ir::DeviceAxis> {
    let mut axes = vec![];
    for stmt in stmts {
        if let Stmt::Loop(l) = stmt {
            if let Annotation::Bound(axis) = l.annotation {
                axes.push(axis);
            }
            axes.extend(bound_axes(&l.body));
        }
    }
    axes
}
