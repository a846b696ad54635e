//! Math plugin: the four arithmetic operations on two numbers.

use rustedkernel_core::error::BoxError;
use rustedkernel_core::function::{KernelArguments, KernelFunction, ParameterSpec, ParameterType};
use std::sync::Arc;

use crate::source::NativePlugin;

#[derive(Debug, Clone, Copy, Default)]
pub struct MathPlugin;

fn operands() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec::required("a", ParameterType::Number, "First operand"),
        ParameterSpec::required("b", ParameterType::Number, "Second operand"),
    ]
}

fn number(args: &KernelArguments, name: &str) -> Result<f64, BoxError> {
    args.get(name)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| format!("'{name}' must be a number").into())
}

/// Integral results come back as JSON integers.
fn to_value(x: f64) -> serde_json::Value {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        serde_json::Value::from(x as i64)
    } else {
        serde_json::Value::from(x)
    }
}

fn binary(
    name: &'static str,
    description: &'static str,
    op: fn(f64, f64) -> Result<f64, BoxError>,
) -> KernelFunction {
    KernelFunction::from_fn(name, description, operands(), move |args| async move {
        let a = number(&args, "a")?;
        let b = number(&args, "b")?;
        op(a, b).map(to_value)
    })
}

impl NativePlugin for MathPlugin {
    fn description(&self) -> &str {
        "Basic arithmetic"
    }

    fn functions(self: Arc<Self>) -> Vec<KernelFunction> {
        vec![
            binary("Add", "Add b to a", |a, b| Ok(a + b)),
            binary("Subtract", "Subtract b from a", |a, b| Ok(a - b)),
            binary("Multiply", "Multiply a by b", |a, b| Ok(a * b)),
            binary("Divide", "Divide a by b", |a, b| {
                if b == 0.0 {
                    Err("division by zero".into())
                } else {
                    Ok(a / b)
                }
            }),
        ]
    }
}
