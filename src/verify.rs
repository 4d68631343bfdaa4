//! Operand checks the host compiler runs when type-checking an operation.
//!
//! Every layout has its own hook ([`LayoutInterface::verify_for_operand`]); on top of it, a
//! [`Context`](crate::context::Context) keeps one [`LayoutVerifier`] per operation name.
//!
//! [`LayoutInterface::verify_for_operand`]: crate::layout::LayoutInterface::verify_for_operand

use thiserror::Error;

use crate::{layout::Layout, num::ScalarType};

/// Type of one tensor value flowing into or out of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    pub shape: Vec<i64>,
    pub element: ScalarType,
    pub layout: Option<Layout>,
}

impl TensorType {
    pub fn new(shape: impl Into<Vec<i64>>, element: ScalarType, layout: Option<Layout>) -> Self {
        Self {
            shape: shape.into(),
            element,
            layout,
        }
    }
}

/// What the host compiler exposes of an operation being verified.
pub trait Operation {
    fn name(&self) -> &str;
    fn operands(&self) -> &[TensorType];
    fn results(&self) -> &[TensorType];
}

/// A plain operation record, for hosts without their own operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationState {
    pub name: String,
    pub operands: Vec<TensorType>,
    pub results: Vec<TensorType>,
}

impl OperationState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operands: vec![],
            results: vec![],
        }
    }

    pub fn with_operand(mut self, operand: TensorType) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn with_result(mut self, result: TensorType) -> Self {
        self.results.push(result);
        self
    }
}

impl Operation for OperationState {
    fn name(&self) -> &str {
        &self.name
    }

    fn operands(&self) -> &[TensorType] {
        &self.operands
    }

    fn results(&self) -> &[TensorType] {
        &self.results
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operand {operand} of {op}: {message}")]
pub struct VerifyError {
    pub op: String,
    pub operand: usize,
    pub message: String,
}

impl VerifyError {
    pub fn new(op: &dyn Operation, operand: usize, message: impl Into<String>) -> Self {
        Self {
            op: op.name().to_string(),
            operand,
            message: message.into(),
        }
    }
}

/// Operation-specific compatibility rules between an operand's layout and the rest of the
/// operation.
pub trait LayoutVerifier: std::fmt::Debug + Send + Sync {
    fn verify(&self, op: &dyn Operation, operand: usize, layout: &Layout) -> Result<(), VerifyError>;
}

/// Rules of `D = A * B + C`, with operands `[A, B, C]` and result `D`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DotVerifier;

impl LayoutVerifier for DotVerifier {
    fn verify(&self, op: &dyn Operation, operand: usize, layout: &Layout) -> Result<(), VerifyError> {
        let error = |message: String| VerifyError::new(op, operand, message);
        let result = op.results().first().and_then(|ty| ty.layout.as_ref());

        let Some(dot) = layout.as_dot_operand() else {
            // the accumulator shares the result layout
            return match (operand, result) {
                (2, Some(result)) if result != layout => Err(error(format!(
                    "accumulator layout {layout} differs from result layout {result}"
                ))),
                _ => Ok(()),
            };
        };

        if operand > 1 || dot.op_idx() as usize != operand {
            return Err(error(format!(
                "dot operand layout with opIdx = {} used as operand {operand}",
                dot.op_idx()
            )));
        }
        if dot.parent().as_mma().is_some_and(|mma| mma.is_hopper()) {
            return Ok(());
        }
        match result {
            Some(result) if result == dot.parent() => {}
            Some(result) => {
                return Err(error(format!(
                    "parent {} differs from result layout {result}",
                    dot.parent()
                )))
            }
            None => return Err(error("result carries no layout".into())),
        }

        let other = op
            .operands()
            .get(1 - operand)
            .and_then(|ty| ty.layout.as_ref())
            .and_then(|layout| layout.as_dot_operand());
        match other {
            Some(other) if other.widen_factor() != dot.widen_factor() => Err(error(format!(
                "kWidth = {} differs from kWidth = {} of the other operand",
                dot.widen_factor(),
                other.widen_factor()
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{OperationState, TensorType, VerifyError};
    use crate::{
        context::{Context, ContextBuilder},
        layout::{BlockedEncoding, CtaLayout, DotOperandEncoding, Layout, MmaEncoding, SharedEncoding},
        num::ScalarType,
    };

    fn mma(context: &Context, major: u32) -> Result<Layout> {
        let instr = match major {
            3 => vec![16, 64, 16],
            _ => vec![16, 8],
        };
        Ok(context.get(MmaEncoding::new(major, 0, vec![2, 2], CtaLayout::default_for(2), instr)?)?)
    }

    fn dot_op(a: &Layout, b: &Layout, c: &Layout, d: &Layout, ty: ScalarType) -> OperationState {
        OperationState::new("dot")
            .with_operand(TensorType::new([64, 32], ty, Some(a.clone())))
            .with_operand(TensorType::new([32, 64], ty, Some(b.clone())))
            .with_operand(TensorType::new([64, 64], ScalarType::F32, Some(c.clone())))
            .with_result(TensorType::new([64, 64], ScalarType::F32, Some(d.clone())))
    }

    fn verify_all(context: &Context, op: &OperationState) -> Result<(), VerifyError> {
        for (index, operand) in op.operands.iter().enumerate() {
            if let Some(layout) = &operand.layout {
                layout.verify_for_operand(context, op, index)?;
            }
        }
        Ok(())
    }

    #[test]
    fn test_dot_accepts() -> Result<()> {
        let context = ContextBuilder::new().build();
        let parent = mma(&context, 2)?;
        let a = context.get(DotOperandEncoding::from_element(0, parent.clone(), ScalarType::F16)?)?;
        let b = context.get(DotOperandEncoding::from_element(1, parent.clone(), ScalarType::F16)?)?;
        let op = dot_op(&a, &b, &parent, &parent, ScalarType::F16);
        verify_all(&context, &op)?;
        Ok(())
    }

    #[test]
    fn test_dot_rejects() -> Result<()> {
        let context = ContextBuilder::new().build();
        let parent = mma(&context, 2)?;
        let a = context.get(DotOperandEncoding::from_element(0, parent.clone(), ScalarType::F16)?)?;
        let b = context.get(DotOperandEncoding::from_element(1, parent.clone(), ScalarType::F16)?)?;

        // swapped operands
        let op = dot_op(&b, &a, &parent, &parent, ScalarType::F16);
        let error = verify_all(&context, &op).unwrap_err();
        assert_eq!(error.operand, 0);
        assert_eq!(error.op, "dot");

        // parent differs from the result layout
        let other = context.get(MmaEncoding::new(2, 0, vec![4, 1], CtaLayout::default_for(2), vec![16, 8])?)?;
        let op = dot_op(&a, &b, &other, &other, ScalarType::F16);
        assert!(verify_all(&context, &op).is_err());

        // accumulator differs from the result layout
        let blocked = context.get(BlockedEncoding::new(
            vec![1, 4],
            vec![8, 4],
            vec![4, 1],
            vec![1, 0],
            CtaLayout::default_for(2),
        )?)?;
        let op = dot_op(&a, &b, &blocked, &parent, ScalarType::F16);
        let error = verify_all(&context, &op).unwrap_err();
        assert_eq!(error.operand, 2);

        // kWidth does not match 8-bit elements
        let op = dot_op(&a, &b, &parent, &parent, ScalarType::I8);
        assert!(verify_all(&context, &op).is_err());

        // kWidth of A and B disagree
        let b = context.get(DotOperandEncoding::new(1, parent.clone(), 4)?)?;
        let op = OperationState::new("dot")
            .with_operand(TensorType::new([64, 32], ScalarType::F16, Some(a.clone())))
            .with_operand(TensorType::new([32, 64], ScalarType::I8, Some(b)))
            .with_operand(TensorType::new([64, 64], ScalarType::F32, Some(parent.clone())))
            .with_result(TensorType::new([64, 64], ScalarType::F32, Some(parent.clone())));
        let error = verify_all(&context, &op).unwrap_err();
        assert!(error.message.contains("kWidth"));
        Ok(())
    }

    #[test]
    fn test_hopper_operands() -> Result<()> {
        let context = ContextBuilder::new().build();
        let parent = mma(&context, 3)?;
        let a = context.get(DotOperandEncoding::from_element(0, parent.clone(), ScalarType::F16)?)?;
        let b = context.get(SharedEncoding::from_shape(
            &[32, 64],
            vec![1, 0],
            CtaLayout::default_for(2),
            ScalarType::F16,
        )?)?;
        let result = mma(&context, 2)?;
        let op = dot_op(&a, &b, &result, &result, ScalarType::F16);
        verify_all(&context, &op)?;
        Ok(())
    }

    #[test]
    fn test_rank_and_unregistered() -> Result<()> {
        let context = ContextBuilder::new().build();
        let blocked = context.get(BlockedEncoding::new(
            vec![1],
            vec![32],
            vec![4],
            vec![0],
            CtaLayout::default_for(1),
        )?)?;
        let op = OperationState::new("load")
            .with_operand(TensorType::new([128], ScalarType::F32, Some(blocked.clone())))
            .with_operand(TensorType::new([16, 8], ScalarType::F32, Some(blocked.clone())));
        blocked.verify_for_operand(&context, &op, 0)?;
        assert!(blocked.verify_for_operand(&context, &op, 1).is_err());
        assert!(blocked.verify_for_operand(&context, &op, 2).is_err());

        let shared = context.get(SharedEncoding::new(8, 1, 8, vec![1, 0], CtaLayout::default_for(2))?)?;
        let op = OperationState::new("copy")
            .with_operand(TensorType::new([3, 64, 64], ScalarType::F16, Some(shared.clone())));
        shared.verify_for_operand(&context, &op, 0)?;
        Ok(())
    }
}
