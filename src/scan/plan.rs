//! Scan plans: qualifier split, device target list, kernel, output mapping.
//!
//! A plan is built once per scan and shared by every task. Qualifiers the
//! device can evaluate go into the kernel; the rest stay on the host and run
//! on each produced tuple together with target entries the device cannot
//! compute.

use std::sync::Arc;

use tracing::debug;

use crate::codegen::estimate::BufferEstimate;
use crate::codegen::eval::AttrSource;
use crate::codegen::expr::Expr;
use crate::codegen::kernel::{KernelCache, KernelSource};
use crate::codegen::projection::{build_projection, TargetEntry};
use crate::config::DEFAULT_THREADS_PER_GROUP;
use crate::error::{CodegenError, EvalError};
use crate::storage::chunk::ChunkFormat;
use crate::storage::schema::TupleShape;
use crate::storage::types::DataType;
use crate::storage::value::Value;

/// Where one output column comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputColumn {
    /// Column of the produced tuple.
    Position(usize),
    /// Evaluated on the host against the produced tuple.
    Host(Expr),
    /// Every source column, in attribute order.
    WholeRow,
}

/// Row handed to host expressions: source attribute numbers are looked up
/// through the plan's attribute map.
pub(crate) struct MappedRow<'a> {
    pub values: &'a [Value],
    pub map: &'a [Option<usize>],
}

impl AttrSource for MappedRow<'_> {
    fn attr(&self, attnum: i16) -> Result<Value, EvalError> {
        if attnum < 1 {
            return Err(EvalError::MissingAttribute(attnum));
        }
        self.map
            .get(attnum as usize - 1)
            .copied()
            .flatten()
            .and_then(|pos| self.values.get(pos))
            .cloned()
            .ok_or(EvalError::MissingAttribute(attnum))
    }
}

/// Immutable description of one scan.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    shape: Arc<TupleShape>,
    dev_quals: Vec<Expr>,
    host_quals: Vec<Expr>,
    tlist: Vec<TargetEntry>,
    tlist_dev: Option<Vec<TargetEntry>>,
    kernel: Arc<KernelSource>,
    attr_map: Vec<Option<usize>>,
    outputs: Vec<OutputColumn>,
}

impl ScanPlan {
    pub fn builder(shape: Arc<TupleShape>) -> ScanPlanBuilder {
        ScanPlanBuilder {
            relid: shape.relid,
            shape,
            quals: Vec::new(),
            tlist: None,
            dest_format: ChunkFormat::Slot,
            estimate: None,
            threads_per_group: DEFAULT_THREADS_PER_GROUP,
        }
    }

    pub fn shape(&self) -> &Arc<TupleShape> {
        &self.shape
    }

    /// Qualifiers compiled into the kernel.
    pub fn dev_quals(&self) -> &[Expr] {
        &self.dev_quals
    }

    /// Qualifiers evaluated on the host after the device pass.
    pub fn host_quals(&self) -> &[Expr] {
        &self.host_quals
    }

    pub fn target_list(&self) -> &[TargetEntry] {
        &self.tlist
    }

    /// Device target list; `None` when tasks return source tuples.
    pub fn tlist_dev(&self) -> Option<&[TargetEntry]> {
        self.tlist_dev.as_deref()
    }

    pub fn kernel(&self) -> &Arc<KernelSource> {
        &self.kernel
    }

    pub fn outputs(&self) -> &[OutputColumn] {
        &self.outputs
    }

    /// Names of the returned columns.
    pub fn output_names(&self) -> Vec<String> {
        self.tlist
            .iter()
            .filter(|t| !t.resjunk)
            .flat_map(|t| match &t.expr {
                Expr::Var { attnum: 0, .. } => {
                    self.shape.attrs().iter().map(|a| a.name.clone()).collect()
                }
                _ => vec![t.name.clone()],
            })
            .collect()
    }

    /// Destination format of the projection, if any.
    pub fn dest_format(&self) -> Option<ChunkFormat> {
        self.kernel
            .program()
            .projection
            .as_ref()
            .map(|p| p.dest_format())
    }

    pub(crate) fn mapped<'a>(&'a self, values: &'a [Value]) -> MappedRow<'a> {
        MappedRow {
            values,
            map: &self.attr_map,
        }
    }
}

/// Builder for [`ScanPlan`].
#[derive(Debug, Clone)]
pub struct ScanPlanBuilder {
    shape: Arc<TupleShape>,
    relid: u32,
    quals: Vec<Expr>,
    tlist: Option<Vec<TargetEntry>>,
    dest_format: ChunkFormat,
    estimate: Option<BufferEstimate>,
    threads_per_group: usize,
}

impl ScanPlanBuilder {
    /// Add one qualifier (the list is implicitly AND-ed).
    pub fn filter(mut self, qual: Expr) -> Self {
        self.quals.push(qual);
        self
    }

    pub fn quals(mut self, quals: Vec<Expr>) -> Self {
        self.quals.extend(quals);
        self
    }

    /// Output columns; defaults to every source column in order.
    pub fn target_list(mut self, tlist: Vec<TargetEntry>) -> Self {
        self.tlist = Some(tlist);
        self
    }

    /// Destination format of the projection (Row or Slot).
    pub fn destination(mut self, format: ChunkFormat) -> Self {
        self.dest_format = format;
        self
    }

    /// Replace the generated destination sizing.
    pub fn buffer_estimate(mut self, estimate: BufferEstimate) -> Self {
        self.estimate = Some(estimate);
        self
    }

    pub fn threads_per_group(mut self, threads: usize) -> Self {
        self.threads_per_group = threads;
        self
    }

    /// Relation id variables must reference; defaults to the shape's.
    pub fn relid(mut self, relid: u32) -> Self {
        self.relid = relid;
        self
    }

    pub fn build(self) -> Result<ScanPlan, CodegenError> {
        self.build_cached(&mut KernelCache::new())
    }

    /// Build, reusing a generated kernel from `cache` when one matches.
    pub fn build_cached(self, cache: &mut KernelCache) -> Result<ScanPlan, CodegenError> {
        if !matches!(self.dest_format, ChunkFormat::Row | ChunkFormat::Slot) {
            return Err(CodegenError::Malformed(format!(
                "{} is not a projection destination",
                self.dest_format
            )));
        }
        let shape = self.shape;
        let tlist = self.tlist.unwrap_or_else(|| identity_tlist(&shape));

        for qual in &self.quals {
            check_attnums(qual, false)?;
            let t = qual.result_type()?;
            if t != DataType::Bool {
                return Err(CodegenError::NotBoolean(t));
            }
        }
        for entry in &tlist {
            check_attnums(&entry.expr, true)?;
            entry.expr.result_type()?;
        }

        let (dev_quals, host_quals): (Vec<Expr>, Vec<Expr>) = self
            .quals
            .into_iter()
            .partition(|q| q.is_device_executable());
        let tlist_dev = build_projection(self.relid, &shape, &tlist, &host_quals, &dev_quals)?;

        let mut kernel = cache.get_or_generate(
            &shape,
            &dev_quals,
            tlist_dev.as_deref(),
            self.dest_format,
            self.threads_per_group,
        )?;
        if let Some(estimate) = self.estimate {
            kernel = Arc::new((*kernel).clone().with_estimate(estimate));
        }

        let (attr_map, outputs) = match &tlist_dev {
            None => source_mapping(&shape, &tlist),
            Some(dev) => projected_mapping(&shape, &tlist, dev),
        };
        debug!(
            dev_quals = dev_quals.len(),
            host_quals = host_quals.len(),
            projection = tlist_dev.as_ref().map(|t| t.len()),
            outputs = outputs.len(),
            "built scan plan"
        );
        Ok(ScanPlan {
            shape,
            dev_quals,
            host_quals,
            tlist,
            tlist_dev,
            kernel,
            attr_map,
            outputs,
        })
    }
}

fn identity_tlist(shape: &TupleShape) -> Vec<TargetEntry> {
    shape
        .attrs()
        .iter()
        .enumerate()
        .map(|(i, a)| TargetEntry::new(&a.name, Expr::var(shape.relid, i as i16 + 1, a.data_type)))
        .collect()
}

/// System attributes are never available; the whole row only as a bare
/// target entry.
fn check_attnums(expr: &Expr, allow_whole_row: bool) -> Result<(), CodegenError> {
    if let Expr::Var { attnum, .. } = expr {
        if *attnum < 0 || (*attnum == 0 && !allow_whole_row) {
            return Err(CodegenError::UnsupportedAttribute { attnum: *attnum });
        }
        return Ok(());
    }
    expr.children()
        .into_iter()
        .try_for_each(|c| check_attnums(c, false))
}

/// Tasks return source tuples.
fn source_mapping(shape: &TupleShape, tlist: &[TargetEntry]) -> (Vec<Option<usize>>, Vec<OutputColumn>) {
    let attr_map = (0..shape.natts()).map(Some).collect();
    let outputs = tlist
        .iter()
        .filter(|t| !t.resjunk)
        .map(|t| match &t.expr {
            Expr::Var { attnum: 0, .. } => OutputColumn::WholeRow,
            Expr::Var { attnum, .. } => OutputColumn::Position(*attnum as usize - 1),
            expr => OutputColumn::Host(expr.clone()),
        })
        .collect();
    (attr_map, outputs)
}

/// Tasks return tuples shaped by the device target list.
fn projected_mapping(
    shape: &TupleShape,
    tlist: &[TargetEntry],
    tlist_dev: &[TargetEntry],
) -> (Vec<Option<usize>>, Vec<OutputColumn>) {
    let mut attr_map = vec![None; shape.natts()];
    for (j, entry) in tlist_dev.iter().enumerate() {
        if let Expr::Var { attnum, .. } = entry.expr {
            if attnum > 0 && attr_map[attnum as usize - 1].is_none() {
                attr_map[attnum as usize - 1] = Some(j);
            }
        }
    }
    let outputs = tlist
        .iter()
        .filter(|t| !t.resjunk)
        .map(|t| match tlist_dev.iter().position(|d| d.expr == t.expr) {
            Some(j) => OutputColumn::Position(j),
            None => OutputColumn::Host(t.expr.clone()),
        })
        .collect();
    (attr_map, outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::AttrDesc;

    fn shape() -> Arc<TupleShape> {
        Arc::new(TupleShape::new(
            1,
            vec![
                AttrDesc::new("id", DataType::Int4),
                AttrDesc::new("v", DataType::Int4),
                AttrDesc::new("s", DataType::Text),
            ],
        ))
    }

    fn var(attnum: i16, t: DataType) -> Expr {
        Expr::var(1, attnum, t)
    }

    // ------------------------------------------------------------------
    // Qualifier split
    // ------------------------------------------------------------------

    #[test]
    fn test_quals_split_by_device_support() {
        let plan = ScanPlan::builder(shape())
            .filter(var(2, DataType::Int4).gt(Expr::int4(8)))
            .filter(var(3, DataType::Text).is_not_null())
            .build()
            .unwrap();
        assert_eq!(plan.dev_quals().len(), 1);
        assert_eq!(plan.host_quals().len(), 1);
    }

    #[test]
    fn test_non_boolean_qual_rejected() {
        let err = ScanPlan::builder(shape())
            .filter(var(2, DataType::Int4) + Expr::int4(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, CodegenError::NotBoolean(DataType::Int4)));
    }

    #[test]
    fn test_system_attribute_rejected() {
        let err = ScanPlan::builder(shape())
            .filter(var(-1, DataType::Int4).gt(Expr::int4(0)))
            .build()
            .unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedAttribute { attnum: -1 }));
    }

    #[test]
    fn test_hash_destination_rejected() {
        assert!(ScanPlan::builder(shape())
            .destination(ChunkFormat::Hash)
            .build()
            .is_err());
    }

    // ------------------------------------------------------------------
    // Output mapping
    // ------------------------------------------------------------------

    #[test]
    fn test_identity_plan_returns_source_tuples() {
        let plan = ScanPlan::builder(shape()).build().unwrap();
        assert!(plan.tlist_dev().is_none());
        assert!(plan.dest_format().is_none());
        assert_eq!(
            plan.outputs(),
            &[
                OutputColumn::Position(0),
                OutputColumn::Position(1),
                OutputColumn::Position(2)
            ]
        );
        assert_eq!(plan.output_names(), vec!["id", "v", "s"]);
    }

    #[test]
    fn test_whole_row_expands() {
        let plan = ScanPlan::builder(shape())
            .target_list(vec![TargetEntry::new("t", var(0, DataType::Int4))])
            .build()
            .unwrap();
        assert!(plan.tlist_dev().is_none());
        assert_eq!(plan.outputs(), &[OutputColumn::WholeRow]);
        assert_eq!(plan.output_names().len(), 3);
    }

    #[test]
    fn test_projection_maps_outputs() {
        let plan = ScanPlan::builder(shape())
            .target_list(vec![
                TargetEntry::new("w", var(2, DataType::Int4) * Expr::int4(2)),
                TargetEntry::new("id", var(1, DataType::Int4)),
            ])
            .filter(var(2, DataType::Int4).gt(Expr::int4(8)))
            .build()
            .unwrap();
        let dev = plan.tlist_dev().unwrap();
        assert_eq!(dev.len(), 3);
        assert!(dev[2].resjunk);
        assert_eq!(
            plan.outputs(),
            &[OutputColumn::Position(0), OutputColumn::Position(1)]
        );
        assert_eq!(plan.dest_format(), Some(ChunkFormat::Slot));
        let row = [Value::Int4(20), Value::Int4(3), Value::Int4(10)];
        let mapped = plan.mapped(&row);
        assert_eq!(mapped.attr(1).unwrap(), Value::Int4(3));
        assert_eq!(mapped.attr(2).unwrap(), Value::Int4(10));
        assert!(mapped.attr(3).is_err());
    }

    #[test]
    fn test_host_only_expression_keeps_its_vars() {
        let plan = ScanPlan::builder(shape())
            .target_list(vec![TargetEntry::new("s_null", var(3, DataType::Text).is_null())])
            .build()
            .unwrap();
        let dev = plan.tlist_dev().unwrap();
        assert_eq!(dev.len(), 1);
        assert!(matches!(plan.outputs()[0], OutputColumn::Host(_)));
        let row = [Value::Null];
        assert_eq!(plan.mapped(&row).attr(3).unwrap(), Value::Null);
    }

    #[test]
    fn test_estimate_override() {
        let plan = ScanPlan::builder(shape())
            .target_list(vec![TargetEntry::new(
                "n",
                var(2, DataType::Int4).cast(DataType::Numeric),
            )])
            .buffer_estimate(BufferEstimate::default())
            .build()
            .unwrap();
        assert_eq!(plan.kernel().estimate(), BufferEstimate::default());
    }

    #[test]
    fn test_cached_build_reuses_kernel() {
        let mut cache = KernelCache::new();
        let a = ScanPlan::builder(shape())
            .filter(var(2, DataType::Int4).gt(Expr::int4(8)))
            .build_cached(&mut cache)
            .unwrap();
        let b = ScanPlan::builder(shape())
            .filter(var(2, DataType::Int4).gt(Expr::int4(8)))
            .build_cached(&mut cache)
            .unwrap();
        assert!(Arc::ptr_eq(a.kernel(), b.kernel()));
        assert_eq!(cache.hits(), 1);
    }
}
