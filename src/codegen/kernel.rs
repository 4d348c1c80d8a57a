//! Complete kernel modules and their cache.
//!
//! A [`KernelSource`] is generated once per scan and shared by every task.
//! It carries the MSL text for the Metal backend and the lowered
//! [`KernelProgram`] the emulated device runs.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::debug;

use crate::codegen::devtype::emit_runtime_header;
use crate::codegen::emit::ExprEmitter;
use crate::codegen::estimate::{estimate_buffer_requirements, BufferEstimate};
use crate::codegen::expr::{hash_expr, Expr};
use crate::codegen::filter::{filter_section, FilterProgram};
use crate::codegen::projection::{projection_section, ProjectionProgram, TargetEntry};
use crate::error::CodegenError;
use crate::storage::chunk::ChunkFormat;
use crate::storage::schema::TupleShape;

pub const QUALS_ROW_KERNEL: &str = "gpuscan_exec_quals_row";
pub const QUALS_BLOCK_KERNEL: &str = "gpuscan_exec_quals_block";
pub const PROJECTION_ROW_KERNEL: &str = "gpuscan_projection_row";
pub const PROJECTION_SLOT_KERNEL: &str = "gpuscan_projection_slot";

/// Lowered kernels of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelProgram {
    pub shape: Arc<TupleShape>,
    pub filter: FilterProgram,
    pub projection: Option<ProjectionProgram>,
}

/// Generated module plus everything a task needs to launch it.
#[derive(Debug, Clone)]
pub struct KernelSource {
    text: String,
    program: Arc<KernelProgram>,
    estimate: BufferEstimate,
    structure_hash: u64,
    threads_per_group: usize,
}

impl KernelSource {
    /// Generate the module for `quals` and an optional device target list
    /// projected into `dest_format`.
    pub fn generate(
        shape: &Arc<TupleShape>,
        quals: &[Expr],
        tlist_dev: Option<&[TargetEntry]>,
        dest_format: ChunkFormat,
        threads_per_group: usize,
    ) -> Result<Self, CodegenError> {
        let mut em = ExprEmitter::new(shape);
        let (filter_src, filter) = filter_section(&mut em, quals)?;
        let (projection_src, projection) = match tlist_dev {
            Some(tlist) => {
                let (src, program) = projection_section(&mut em, tlist, dest_format)?;
                (src, Some(program))
            }
            None => (String::new(), None),
        };
        let estimate = match tlist_dev {
            Some(tlist) => estimate_buffer_requirements(tlist, shape)?,
            None => BufferEstimate::default(),
        };

        let mut text = String::with_capacity(16 * 1024);
        emit_runtime_header(&mut text, threads_per_group);
        em.emit_support(&mut text)?;
        text.push_str(&filter_src);
        text.push_str(&projection_src);

        let structure_hash = kernel_hash(shape, quals, tlist_dev, dest_format, threads_per_group);
        debug!(
            hash = format_args!("{:016x}", structure_hash),
            bytes = text.len(),
            quals = quals.len(),
            projection = tlist_dev.is_some(),
            "generated kernel source"
        );
        Ok(Self {
            text,
            program: Arc::new(KernelProgram {
                shape: Arc::clone(shape),
                filter,
                projection,
            }),
            estimate,
            structure_hash,
            threads_per_group,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn program(&self) -> &Arc<KernelProgram> {
        &self.program
    }

    pub fn estimate(&self) -> BufferEstimate {
        self.estimate
    }

    /// Replace the sizing estimate. Undersized estimates are legal and
    /// surface as a recoverable "no space" status at run time.
    pub fn with_estimate(mut self, estimate: BufferEstimate) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn structure_hash(&self) -> u64 {
        self.structure_hash
    }

    pub fn threads_per_group(&self) -> usize {
        self.threads_per_group
    }

    /// Entry points present in the module.
    pub fn entry_points(&self) -> Vec<&'static str> {
        let mut names = vec![QUALS_ROW_KERNEL, QUALS_BLOCK_KERNEL];
        if let Some(p) = &self.program.projection {
            names.push(match p.dest_format() {
                ChunkFormat::Row => PROJECTION_ROW_KERNEL,
                _ => PROJECTION_SLOT_KERNEL,
            });
        }
        names
    }
}

/// Cache key: everything that changes the generated text. Literal values
/// count because they are inlined.
pub fn kernel_hash(
    shape: &TupleShape,
    quals: &[Expr],
    tlist_dev: Option<&[TargetEntry]>,
    dest_format: ChunkFormat,
    threads_per_group: usize,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    shape.hash(&mut hasher);
    quals.len().hash(&mut hasher);
    for q in quals {
        hash_expr(q, &mut hasher);
    }
    match tlist_dev {
        Some(tlist) => {
            tlist.len().hash(&mut hasher);
            for entry in tlist {
                entry.name.hash(&mut hasher);
                hash_expr(&entry.expr, &mut hasher);
            }
            dest_format.hash(&mut hasher);
        }
        None => 0usize.hash(&mut hasher),
    }
    threads_per_group.hash(&mut hasher);
    hasher.finish()
}

/// Generated modules keyed by [`kernel_hash`].
#[derive(Debug, Default)]
pub struct KernelCache {
    entries: HashMap<u64, Arc<KernelSource>>,
    hits: u64,
    misses: u64,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached module on hit; generate and insert on miss.
    pub fn get_or_generate(
        &mut self,
        shape: &Arc<TupleShape>,
        quals: &[Expr],
        tlist_dev: Option<&[TargetEntry]>,
        dest_format: ChunkFormat,
        threads_per_group: usize,
    ) -> Result<Arc<KernelSource>, CodegenError> {
        let hash = kernel_hash(shape, quals, tlist_dev, dest_format, threads_per_group);
        if let Some(found) = self.entries.get(&hash) {
            self.hits += 1;
            return Ok(Arc::clone(found));
        }
        self.misses += 1;
        let source = Arc::new(KernelSource::generate(
            shape,
            quals,
            tlist_dev,
            dest_format,
            threads_per_group,
        )?);
        self.entries.insert(hash, Arc::clone(&source));
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
