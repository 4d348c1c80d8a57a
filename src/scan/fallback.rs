//! Host re-evaluation of a chunk the device gave up on.
//!
//! The device results of the chunk are discarded. Every source tuple runs
//! through the device qualifiers and the device target list again, this
//! time with host semantics: values the device could not represent are
//! computed exactly, and real errors (overflow, division by zero) surface as
//! [`ScanError::Evaluation`].

use crate::codegen::eval::Evaluator;
use crate::error::ScanError;
use crate::scan::plan::ScanPlan;
use crate::storage::value::Value;

/// Re-run the device part of `plan` on one source tuple. `None` when the
/// tuple fails the device qualifiers.
pub(crate) fn reevaluate(plan: &ScanPlan, values: Vec<Value>) -> Result<Option<Vec<Value>>, ScanError> {
    let host = Evaluator::host();
    if !host.eval_quals(plan.dev_quals(), &values)? {
        return Ok(None);
    }
    let Some(tlist_dev) = plan.tlist_dev() else {
        return Ok(Some(values));
    };
    let projected = tlist_dev
        .iter()
        .map(|entry| host.eval(&entry.expr, &values))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(projected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::expr::Expr;
    use crate::codegen::projection::TargetEntry;
    use crate::error::EvalError;
    use crate::storage::schema::{AttrDesc, TupleShape};
    use crate::storage::types::DataType;
    use crate::storage::value::Numeric;
    use std::sync::Arc;

    fn shape() -> Arc<TupleShape> {
        Arc::new(TupleShape::new(
            1,
            vec![
                AttrDesc::new("id", DataType::Int4),
                AttrDesc::new("v", DataType::Int4),
            ],
        ))
    }

    fn v() -> Expr {
        Expr::var(1, 2, DataType::Int4)
    }

    #[test]
    fn test_failing_qual_skips_row() {
        let plan = ScanPlan::builder(shape())
            .filter(v().gt(Expr::int4(8)))
            .build()
            .unwrap();
        let out = reevaluate(&plan, vec![Value::Int4(1), Value::Int4(5)]).unwrap();
        assert!(out.is_none());
        let out = reevaluate(&plan, vec![Value::Int4(1), Value::Int4(9)]).unwrap();
        assert_eq!(out, Some(vec![Value::Int4(1), Value::Int4(9)]));
    }

    #[test]
    fn test_projection_evaluated_exactly() {
        let plan = ScanPlan::builder(shape())
            .target_list(vec![TargetEntry::new("n", v().cast(DataType::Numeric))])
            .build()
            .unwrap();
        let out = reevaluate(&plan, vec![Value::Int4(1), Value::Int4(30)]).unwrap();
        assert_eq!(out, Some(vec![Value::Numeric(Numeric::from_i64(30))]));
    }

    #[test]
    fn test_overflow_is_an_evaluation_error() {
        let plan = ScanPlan::builder(shape())
            .filter((v() * Expr::int4(i32::MAX)).gt(Expr::int4(0)))
            .build()
            .unwrap();
        let err = reevaluate(&plan, vec![Value::Int4(1), Value::Int4(10)]).unwrap_err();
        assert!(matches!(
            err,
            ScanError::Evaluation(EvalError::Overflow(DataType::Int4))
        ));
    }
}
