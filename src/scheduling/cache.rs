use crate::ir::{Buffer, BlockRef, LoopNest, MemScope};
use crate::scheduling::ScheduleError;

impl LoopNest {
    /// Stages one of `block`'s reads through a new buffer in `scope`.
    ///
    /// A copy block, named after the new buffer, is placed in its own loop nest just before the
    /// top-level statement containing `block`, and only the read at `read_index` is redirected
    /// to the copy. Returns the copy block. Invalidates all handles.
    pub fn cache_read(
        &mut self,
        block: &BlockRef,
        read_index: usize,
        scope: MemScope,
    ) -> Result<BlockRef, ScheduleError> {
        let site = self.block_site(block)?;
        let consumer = self.block_at(&site.path);
        let src = consumer
            .reads
            .get(read_index)
            .ok_or_else(|| ScheduleError::InvalidReadIndex {
                block: consumer.name.clone(),
                index: read_index,
            })?
            .buffer;

        let src_buffer = self.buffer(src).clone();
        let name = self.fresh_buffer_name(&format!("{}_{scope}", src_buffer.name));
        let dst = self.add_buffer(Buffer {
            name: name.clone(),
            scope,
            ..src_buffer
        });
        let copy = self.copy_stmt(&name, src, dst);

        self.block_at_mut(&site.path).reads[read_index].buffer = dst;
        self.exprs[site.path.expr].insert(site.path.steps[0], copy);
        self.invalidate_handles();
        log::debug!("cached read {read_index} of block through {name}");
        self.get_block(&name)
    }

    /// Makes `block` compute into a new buffer in `scope` and copies the result back out.
    ///
    /// The computing block is renamed after the new buffer. A copy block keeping the original
    /// name is placed right after the top-level statement containing `block`. Returns the
    /// computing block. Invalidates all handles.
    pub fn cache_write(
        &mut self,
        block: &BlockRef,
        write_index: usize,
        scope: MemScope,
    ) -> Result<BlockRef, ScheduleError> {
        let site = self.block_site(block)?;
        let producer = self.block_at(&site.path);
        if write_index != 0 {
            return Err(ScheduleError::InvalidWriteIndex {
                block: producer.name.clone(),
                index: write_index,
            });
        }
        let original_name = producer.name.clone();
        let old = producer.write.buffer;

        let old_buffer = self.buffer(old).clone();
        let name = self.fresh_buffer_name(&format!("{}_{scope}", old_buffer.name));
        let new = self.add_buffer(Buffer {
            name: name.clone(),
            scope,
            ..old_buffer
        });

        let producer = self.block_at_mut(&site.path);
        producer.name = name.clone();
        producer.write.buffer = new;
        for read in producer.reads.iter_mut().filter(|r| r.buffer == old) {
            read.buffer = new;
        }

        let copy = self.copy_stmt(&original_name, new, old);
        self.exprs[site.path.expr].insert(site.path.steps[0] + 1, copy);
        self.invalidate_handles();
        log::debug!("block {original_name} now computes into {name}");
        self.get_block(&name)
    }
}
