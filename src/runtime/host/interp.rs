//! Work-item interpreter for compiled host kernels.
//!
//! Work-groups run in order, and the work-items of a group run one after
//! another. Kernels in the supported subset have no barriers, so this is a
//! valid schedule.

use std::fmt;

use crate::element::{ScalarType, ScalarValue};

use super::parser::{BinaryOp, Expr, KernelDef, MathFn, Stmt, UnaryOp, WorkItemFn};

pub type Value = ScalarValue;

/// A fault raised while a kernel runs. Reported as a device execution error.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    OutOfBounds {
        param: String,
        index: i64,
        len: usize,
    },
    DivisionByZero,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::OutOfBounds { param, index, len } => write!(
                f,
                "out-of-bounds access {param}[{index}] (buffer holds {len} elements)"
            ),
            Fault::DivisionByZero => write!(f, "integer division by zero"),
        }
    }
}

impl ScalarValue {
    pub(crate) fn zero(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Float => ScalarValue::Float(0.0),
            ScalarType::Int => ScalarValue::Int(0),
            ScalarType::UInt => ScalarValue::UInt(0),
        }
    }

    /// C conversion to `ty`. Float to integer truncates toward zero and
    /// saturates; integer conversions wrap.
    pub(crate) fn convert(self, ty: ScalarType) -> Self {
        match (self, ty) {
            (ScalarValue::Float(v), ScalarType::Float) => ScalarValue::Float(v),
            (ScalarValue::Float(v), ScalarType::Int) => ScalarValue::Int(v as i32),
            (ScalarValue::Float(v), ScalarType::UInt) => ScalarValue::UInt(v as u32),
            (ScalarValue::Int(v), ScalarType::Float) => ScalarValue::Float(v as f32),
            (ScalarValue::Int(v), ScalarType::Int) => ScalarValue::Int(v),
            (ScalarValue::Int(v), ScalarType::UInt) => ScalarValue::UInt(v as u32),
            (ScalarValue::UInt(v), ScalarType::Float) => ScalarValue::Float(v as f32),
            (ScalarValue::UInt(v), ScalarType::Int) => ScalarValue::Int(v as i32),
            (ScalarValue::UInt(v), ScalarType::UInt) => ScalarValue::UInt(v),
        }
    }

    fn is_true(self) -> bool {
        match self {
            ScalarValue::Float(v) => v != 0.0,
            ScalarValue::Int(v) => v != 0,
            ScalarValue::UInt(v) => v != 0,
        }
    }

    fn as_index(self) -> i64 {
        match self {
            ScalarValue::Float(v) => v as i64,
            ScalarValue::Int(v) => v as i64,
            ScalarValue::UInt(v) => v as i64,
        }
    }
}

fn flag(b: bool) -> Value {
    Value::Int(b as i32)
}

fn arith(op: BinaryOp, ty: ScalarType, a: Value, b: Value) -> Result<Value, Fault> {
    let (a, b) = (a.convert(ty), b.convert(ty));
    let value = match (a, b) {
        (Value::Float(x), Value::Float(y)) => match op {
            BinaryOp::Add => Value::Float(x + y),
            BinaryOp::Sub => Value::Float(x - y),
            BinaryOp::Mul => Value::Float(x * y),
            BinaryOp::Div => Value::Float(x / y),
            BinaryOp::Rem => Value::Float(x % y),
            BinaryOp::Lt => flag(x < y),
            BinaryOp::Le => flag(x <= y),
            BinaryOp::Gt => flag(x > y),
            BinaryOp::Ge => flag(x >= y),
            BinaryOp::Eq => flag(x == y),
            BinaryOp::Ne => flag(x != y),
            BinaryOp::And | BinaryOp::Or => unreachable!("logical ops short-circuit"),
        },
        (Value::Int(x), Value::Int(y)) => match op {
            BinaryOp::Add => Value::Int(x.wrapping_add(y)),
            BinaryOp::Sub => Value::Int(x.wrapping_sub(y)),
            BinaryOp::Mul => Value::Int(x.wrapping_mul(y)),
            BinaryOp::Div if y == 0 => return Err(Fault::DivisionByZero),
            BinaryOp::Div => Value::Int(x.wrapping_div(y)),
            BinaryOp::Rem if y == 0 => return Err(Fault::DivisionByZero),
            BinaryOp::Rem => Value::Int(x.wrapping_rem(y)),
            BinaryOp::Lt => flag(x < y),
            BinaryOp::Le => flag(x <= y),
            BinaryOp::Gt => flag(x > y),
            BinaryOp::Ge => flag(x >= y),
            BinaryOp::Eq => flag(x == y),
            BinaryOp::Ne => flag(x != y),
            BinaryOp::And | BinaryOp::Or => unreachable!("logical ops short-circuit"),
        },
        (Value::UInt(x), Value::UInt(y)) => match op {
            BinaryOp::Add => Value::UInt(x.wrapping_add(y)),
            BinaryOp::Sub => Value::UInt(x.wrapping_sub(y)),
            BinaryOp::Mul => Value::UInt(x.wrapping_mul(y)),
            BinaryOp::Div if y == 0 => return Err(Fault::DivisionByZero),
            BinaryOp::Div => Value::UInt(x / y),
            BinaryOp::Rem if y == 0 => return Err(Fault::DivisionByZero),
            BinaryOp::Rem => Value::UInt(x % y),
            BinaryOp::Lt => flag(x < y),
            BinaryOp::Le => flag(x <= y),
            BinaryOp::Gt => flag(x > y),
            BinaryOp::Ge => flag(x >= y),
            BinaryOp::Eq => flag(x == y),
            BinaryOp::Ne => flag(x != y),
            BinaryOp::And | BinaryOp::Or => unreachable!("logical ops short-circuit"),
        },
        _ => unreachable!("operands converted to a common type"),
    };
    Ok(value)
}

fn math(func: MathFn, ty: ScalarType, args: &[Value]) -> Value {
    let args: Vec<Value> = args.iter().map(|a| a.convert(ty)).collect();
    match (func, args.as_slice()) {
        (MathFn::Sqrt, [Value::Float(x)]) => Value::Float(x.sqrt()),
        (MathFn::Fabs, [Value::Float(x)]) => Value::Float(x.abs()),
        (MathFn::Min, [Value::Float(x), Value::Float(y)]) => Value::Float(x.min(*y)),
        (MathFn::Max, [Value::Float(x), Value::Float(y)]) => Value::Float(x.max(*y)),
        (MathFn::Min, [Value::Int(x), Value::Int(y)]) => Value::Int(*x.min(y)),
        (MathFn::Max, [Value::Int(x), Value::Int(y)]) => Value::Int(*x.max(y)),
        (MathFn::Min, [Value::UInt(x), Value::UInt(y)]) => Value::UInt(*x.min(y)),
        (MathFn::Max, [Value::UInt(x), Value::UInt(y)]) => Value::UInt(*x.max(y)),
        _ => unreachable!("math builtins are type checked"),
    }
}

/// Memory and scalar arguments for one launch, indexed by parameter.
pub struct Bindings<'m> {
    pub views: Vec<&'m mut [u8]>,
    /// For each parameter, the index into `views` of its buffer.
    pub param_view: Vec<Option<usize>>,
    pub scalars: Vec<Option<Value>>,
}

#[derive(Clone, Copy)]
struct Ids {
    global_id: usize,
    local_id: usize,
    group_id: usize,
    global_size: usize,
    local_size: usize,
    num_groups: usize,
}

enum Flow {
    Continue,
    Return,
}

/// Runs `kernel` over a 1-D grid of `global` work-items in groups of `local`.
/// `local` must divide `global`.
pub fn execute(
    kernel: &KernelDef,
    bindings: &mut Bindings<'_>,
    global: usize,
    local: usize,
) -> Result<(), Fault> {
    let num_groups = global / local;
    let mut initial = vec![Value::Int(0); kernel.slots];
    for &(param, slot) in &kernel.scalar_slots {
        if let Some(value) = bindings.scalars.get(param).copied().flatten() {
            initial[slot] = value;
        }
    }

    let mut locals = initial.clone();
    for group_id in 0..num_groups {
        for local_id in 0..local {
            let ids = Ids {
                global_id: group_id * local + local_id,
                local_id,
                group_id,
                global_size: global,
                local_size: local,
                num_groups,
            };
            locals.clone_from(&initial);
            let mut item = WorkItem {
                kernel,
                bindings,
                locals: &mut locals,
                ids,
            };
            item.block(&kernel.body)?;
        }
    }
    Ok(())
}

struct WorkItem<'a, 'b, 'm> {
    kernel: &'a KernelDef,
    bindings: &'b mut Bindings<'m>,
    locals: &'a mut Vec<Value>,
    ids: Ids,
}

impl WorkItem<'_, '_, '_> {
    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow, Fault> {
        for stmt in stmts {
            if let Flow::Return = self.stmt(stmt)? {
                return Ok(Flow::Return);
            }
        }
        Ok(Flow::Continue)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Flow, Fault> {
        match stmt {
            Stmt::Assign { slot, ty, value } => {
                let v = self.eval(value)?.convert(*ty);
                self.locals[*slot] = v;
            }
            Stmt::Store {
                param,
                elem,
                index,
                value,
            } => {
                let index = self.eval(index)?.as_index();
                let v = self.eval(value)?.convert(*elem);
                let bytes = self.element(*param, index)?;
                bytes.copy_from_slice(&v.to_ne_bytes());
            }
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.is_true() {
                        return self.block(body);
                    }
                }
                return self.block(otherwise);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.block(init)?;
                loop {
                    if let Some(cond) = cond {
                        if !self.eval(cond)?.is_true() {
                            break;
                        }
                    }
                    if let Flow::Return = self.block(body)? {
                        return Ok(Flow::Return);
                    }
                    self.block(step)?;
                }
            }
            Stmt::Return => return Ok(Flow::Return),
        }
        Ok(Flow::Continue)
    }

    /// The four bytes of element `index` of the buffer bound to `param`.
    fn element(&mut self, param: usize, index: i64) -> Result<&mut [u8], Fault> {
        let name = &self.kernel.params[param].name;
        let view = self.bindings.param_view[param]
            .and_then(|v| self.bindings.views.get_mut(v))
            .ok_or_else(|| Fault::OutOfBounds {
                param: name.clone(),
                index,
                len: 0,
            })?;
        let len = view.len() / 4;
        if index < 0 || index as u64 >= len as u64 {
            return Err(Fault::OutOfBounds {
                param: name.clone(),
                index,
                len,
            });
        }
        let start = index as usize * 4;
        Ok(&mut view[start..start + 4])
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Fault> {
        Ok(match expr {
            Expr::Const(v) => *v,
            Expr::Local(slot) => self.locals[*slot],
            Expr::Load { param, elem, index } => {
                let index = self.eval(index)?.as_index();
                let bytes = self.element(*param, index)?;
                Value::from_ne_bytes(*elem, [bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            Expr::Unary(UnaryOp::Neg, ty, operand) => match self.eval(operand)?.convert(*ty) {
                Value::Float(v) => Value::Float(-v),
                Value::Int(v) => Value::Int(v.wrapping_neg()),
                Value::UInt(v) => Value::UInt(v.wrapping_neg()),
            },
            Expr::Unary(UnaryOp::Not, _, operand) => flag(!self.eval(operand)?.is_true()),
            Expr::Binary(BinaryOp::And, _, lhs, rhs) => {
                flag(self.eval(lhs)?.is_true() && self.eval(rhs)?.is_true())
            }
            Expr::Binary(BinaryOp::Or, _, lhs, rhs) => {
                flag(self.eval(lhs)?.is_true() || self.eval(rhs)?.is_true())
            }
            Expr::Binary(op, ty, lhs, rhs) => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                arith(*op, *ty, a, b)?
            }
            Expr::Cast(ty, operand) => self.eval(operand)?.convert(*ty),
            Expr::WorkItem(func, dim) => {
                let dim = self.eval(dim)?.as_index();
                Value::UInt(self.work_item(*func, dim) as u32)
            }
            Expr::WorkDim => Value::UInt(1),
            Expr::Math(func, ty, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                math(*func, *ty, &values)
            }
        })
    }

    /// Dimensions past the first behave as a grid of extent one.
    fn work_item(&self, func: WorkItemFn, dim: i64) -> usize {
        let ids = &self.ids;
        match (func, dim) {
            (WorkItemFn::GlobalId, 0) => ids.global_id,
            (WorkItemFn::LocalId, 0) => ids.local_id,
            (WorkItemFn::GroupId, 0) => ids.group_id,
            (WorkItemFn::GlobalSize, 0) => ids.global_size,
            (WorkItemFn::LocalSize, 0) => ids.local_size,
            (WorkItemFn::NumGroups, 0) => ids.num_groups,
            (WorkItemFn::GlobalId | WorkItemFn::LocalId | WorkItemFn::GroupId, _) => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{from_bytes, to_bytes};
    use crate::runtime::host::parser::parse_program;
    use crate::source::Macros;

    fn kernel(src: &str) -> KernelDef {
        parse_program(src, &Macros::new()).unwrap().remove(0)
    }

    #[test]
    fn test_vector_add() {
        let k = kernel(
            "__kernel void add(__global float* x, __global float* y, __global float* z) {\
               const int i = get_global_id(0); z[i] = y[i] + x[i]; }",
        );
        let mut x = to_bytes(&[1.0f32, 2.0, 3.0, 4.0]);
        let mut y = to_bytes(&[0.5f32, 0.5, 0.5, 0.5]);
        let mut z = vec![0u8; 16];
        let mut bindings = Bindings {
            views: vec![&mut x[..], &mut y[..], &mut z[..]],
            param_view: vec![Some(0), Some(1), Some(2)],
            scalars: vec![None, None, None],
        };
        execute(&k, &mut bindings, 4, 2).unwrap();
        assert_eq!(from_bytes::<f32>(&z), vec![1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn test_guarded_scale_with_scalars() {
        let k = kernel(
            "__kernel void scale(__global float* v, float f, int n) {\
               int i = get_global_id(0); if (i >= n) return; v[i] *= f; }",
        );
        let mut v = to_bytes(&[1.0f32, 2.0, 3.0, 4.0]);
        let mut bindings = Bindings {
            views: vec![&mut v[..]],
            param_view: vec![Some(0), None, None],
            scalars: vec![None, Some(Value::Float(2.0)), Some(Value::Int(3))],
        };
        execute(&k, &mut bindings, 4, 4).unwrap();
        assert_eq!(from_bytes::<f32>(&v), vec![2.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_loop_and_ids() {
        let k = kernel(
            "__kernel void ids(__global uint* out) {\
               uint g = get_global_id(0); uint s = 0;\
               for (uint k = 0; k <= get_local_id(0); k++) s += 1;\
               out[g] = s * 100u + get_group_id(0) * 10u + get_num_groups(0); }",
        );
        let mut out = vec![0u8; 16];
        let mut bindings = Bindings {
            views: vec![&mut out[..]],
            param_view: vec![Some(0)],
            scalars: vec![None],
        };
        execute(&k, &mut bindings, 4, 2).unwrap();
        assert_eq!(from_bytes::<u32>(&out), vec![102, 202, 112, 212]);
    }

    #[test]
    fn test_out_of_bounds_faults() {
        let k = kernel("__kernel void f(__global int* z) { z[get_global_id(0) + 1] = 1; }");
        let mut z = vec![0u8; 8];
        let mut bindings = Bindings {
            views: vec![&mut z[..]],
            param_view: vec![Some(0)],
            scalars: vec![None],
        };
        let fault = execute(&k, &mut bindings, 2, 1).unwrap_err();
        assert_eq!(
            fault,
            Fault::OutOfBounds {
                param: "z".into(),
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn test_else_if_chain_takes_first_match() {
        let k = kernel(
            "__kernel void grade(__global int* out) {\
               int i = get_global_id(0);\
               if (i < 1) out[i] = 10; else if (i < 3) out[i] = 20; else if (i < 2) out[i] = 30;\
               else out[i] = 40; }",
        );
        let mut out = vec![0u8; 16];
        let mut bindings = Bindings {
            views: vec![&mut out[..]],
            param_view: vec![Some(0)],
            scalars: vec![None],
        };
        execute(&k, &mut bindings, 4, 4).unwrap();
        assert_eq!(from_bytes::<i32>(&out), vec![10, 20, 20, 40]);
    }

    #[test]
    fn test_integer_semantics() {
        let k = kernel(
            "__kernel void f(__global int* z) {\
               z[0] = 7 / 2; z[1] = -7 % 3; z[2] = (int)2.9f; z[3] = 1 / (z[0] - 3); }",
        );
        let mut z = vec![0u8; 16];
        let mut bindings = Bindings {
            views: vec![&mut z[..]],
            param_view: vec![Some(0)],
            scalars: vec![None],
        };
        assert_eq!(execute(&k, &mut bindings, 1, 1), Err(Fault::DivisionByZero));
        assert_eq!(from_bytes::<i32>(&z)[..3], [3, -1, 2]);
    }
}
