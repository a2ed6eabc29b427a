use crate::ir::{Access, BlockRef, Expr, IterKind, LoopNest, Operand};
use crate::scheduling::ScheduleError;

impl LoopNest {
    /// Substitutes `block`'s computation into the single access that reads its output, then
    /// removes the block and any loops left empty.
    ///
    /// The consumer takes over the producer's reads in place of the replaced one, and the
    /// operand that named that read becomes the producer's op applied to them.
    ///
    /// The block must be a pure spatial map: no reduction, no predicates, and an output indexed
    /// directly by its iteration variables. Invalidates all handles.
    pub fn compute_inline(&mut self, block: &BlockRef) -> Result<(), ScheduleError> {
        let site = self.block_site(block)?;
        let producer = self.block_at(&site.path).clone();
        let fail = |reason: String| ScheduleError::InlineNotApplicable {
            block: producer.name.clone(),
            reason,
        };

        if producer.has_reduction() {
            return Err(fail("it has a reduction".to_owned()));
        }
        if !producer.predicates.is_empty() {
            return Err(fail("it is guarded by predicates".to_owned()));
        }
        let output = producer.write.buffer;
        if producer.reads_buffer(output) {
            return Err(fail("it reads its own output".to_owned()));
        }
        let identity_write = producer.write.indices.len() == producer.iters.len()
            && producer
                .write
                .indices
                .iter()
                .zip(&producer.iters)
                .all(|(index, iv)| iv.kind == IterKind::Spatial && *index == Expr::var(iv.var));
        if !identity_write {
            return Err(fail(
                "its output is not indexed by its iteration variables".to_owned(),
            ));
        }

        let mut sites = vec![];
        for reader in self.block_sites() {
            if reader.path == site.path {
                continue;
            }
            let consumer = self.block_at(&reader.path);
            for (index, access) in consumer.reads.iter().enumerate() {
                if access.buffer == output {
                    sites.push((reader.path.clone(), index));
                }
            }
        }
        let [(consumer_path, read_index)] = sites.as_slice() else {
            return Err(fail(format!("it has {} consumer sites", sites.len())));
        };

        let consumer = self.block_at_mut(consumer_path);
        let at = consumer.reads[*read_index].indices.clone();
        let spliced = producer
            .reads
            .iter()
            .map(|read| Access {
                buffer: read.buffer,
                indices: read
                    .indices
                    .iter()
                    .map(|index| {
                        index.map_vars(&mut |v| {
                            match producer.iters.iter().position(|iv| iv.var == *v) {
                                Some(pos) => at[pos].clone(),
                                None => Expr::var(*v),
                            }
                        })
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        let replacement = Operand::Inlined {
            block: producer.name.clone(),
            op: producer.op.clone(),
            args: producer
                .operands
                .iter()
                .map(|arg| arg.offset(*read_index))
                .collect(),
        };
        for operand in &mut consumer.operands {
            operand.splice(*read_index, &replacement, spliced.len());
        }
        consumer
            .reads
            .splice(*read_index..*read_index + 1, spliced);
        let consumer_name = consumer.name.clone();

        self.remove_stmt(&site.path);
        self.prune_empty();
        self.invalidate_handles();
        log::trace!("inlined {} into {consumer_name}", producer.name);
        Ok(())
    }
}
