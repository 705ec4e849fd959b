// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Scalar expressions evaluated over chunks with Arrow compute kernels.
//!
//! Responsibilities:
//! - Column references, literals, comparisons, boolean logic, arithmetic and
//!   null checks used by filter and project nodes.
//! - Type resolution against an input schema and numeric coercion between
//!   mismatched operands.
//!
//! Key exported interfaces:
//! - Types: `Expr`, `LiteralValue`, `CompareOp`, `ArithOp`.
//! - Functions: `field_ref`, `literal`, `equal`, `greater_equal`, `multiply`, ...
//!
//! `Display` renders the canonical expression text, e.g. `(i32 >= 0)` or
//! `multiply(i32, 2)`; project nodes use it as the default output name.

use std::fmt;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray, new_null_array,
};
use arrow::compute::kernels::boolean::{and_kleene, not as bool_not, or_kleene};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::numeric;
use arrow::compute::{cast, is_null as array_is_null};
use arrow::datatypes::{DataType, Schema};

use crate::exec::chunk::Chunk;
use crate::exec::error::{ExecError, ExecResult};

#[derive(Clone, Debug, PartialEq)]
pub enum LiteralValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl LiteralValue {
    fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Null => DataType::Null,
            LiteralValue::Bool(_) => DataType::Boolean,
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::Utf8(_) => DataType::Utf8,
        }
    }

    fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            LiteralValue::Null => new_null_array(&DataType::Null, len),
            LiteralValue::Bool(v) => Arc::new(BooleanArray::from(vec![*v; len])),
            LiteralValue::Int64(v) => Arc::new(Int64Array::from_value(*v, len)),
            LiteralValue::Float64(v) => Arc::new(Float64Array::from_value(*v, len)),
            LiteralValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str(); len])),
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Null => write!(f, "null"),
            LiteralValue::Bool(v) => write!(f, "{}", v),
            LiteralValue::Int64(v) => write!(f, "{}", v),
            LiteralValue::Float64(v) => write!(f, "{}", v),
            LiteralValue::Utf8(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<bool> for LiteralValue {
    fn from(v: bool) -> Self {
        LiteralValue::Bool(v)
    }
}

impl From<i32> for LiteralValue {
    fn from(v: i32) -> Self {
        LiteralValue::Int64(v as i64)
    }
}

impl From<i64> for LiteralValue {
    fn from(v: i64) -> Self {
        LiteralValue::Int64(v)
    }
}

impl From<f64> for LiteralValue {
    fn from(v: f64) -> Self {
        LiteralValue::Float64(v)
    }
}

impl From<&str> for LiteralValue {
    fn from(v: &str) -> Self {
        LiteralValue::Utf8(v.to_string())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithOp {
    fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Subtract => "subtract",
            ArithOp::Multiply => "multiply",
            ArithOp::Divide => "divide",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(LiteralValue),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

pub fn field_ref(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

pub fn literal(value: impl Into<LiteralValue>) -> Expr {
    Expr::Literal(value.into())
}

pub fn null_literal() -> Expr {
    Expr::Literal(LiteralValue::Null)
}

fn compare(op: CompareOp, left: Expr, right: Expr) -> Expr {
    Expr::Compare(op, Box::new(left), Box::new(right))
}

pub fn equal(left: Expr, right: Expr) -> Expr {
    compare(CompareOp::Eq, left, right)
}

pub fn not_equal(left: Expr, right: Expr) -> Expr {
    compare(CompareOp::Ne, left, right)
}

pub fn less(left: Expr, right: Expr) -> Expr {
    compare(CompareOp::Lt, left, right)
}

pub fn less_equal(left: Expr, right: Expr) -> Expr {
    compare(CompareOp::Le, left, right)
}

pub fn greater(left: Expr, right: Expr) -> Expr {
    compare(CompareOp::Gt, left, right)
}

pub fn greater_equal(left: Expr, right: Expr) -> Expr {
    compare(CompareOp::Ge, left, right)
}

fn arith(op: ArithOp, left: Expr, right: Expr) -> Expr {
    Expr::Arith(op, Box::new(left), Box::new(right))
}

pub fn add(left: Expr, right: Expr) -> Expr {
    arith(ArithOp::Add, left, right)
}

pub fn subtract(left: Expr, right: Expr) -> Expr {
    arith(ArithOp::Subtract, left, right)
}

pub fn multiply(left: Expr, right: Expr) -> Expr {
    arith(ArithOp::Multiply, left, right)
}

pub fn divide(left: Expr, right: Expr) -> Expr {
    arith(ArithOp::Divide, left, right)
}

pub fn and(left: Expr, right: Expr) -> Expr {
    Expr::And(Box::new(left), Box::new(right))
}

pub fn or(left: Expr, right: Expr) -> Expr {
    Expr::Or(Box::new(left), Box::new(right))
}

pub fn not(expr: Expr) -> Expr {
    Expr::Not(Box::new(expr))
}

pub fn is_null(expr: Expr) -> Expr {
    Expr::IsNull(Box::new(expr))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{}", name),
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Compare(op, l, r) => write!(f, "({} {} {})", l, op.symbol(), r),
            Expr::Arith(op, l, r) => write!(f, "{}({}, {})", op.name(), l, r),
            Expr::And(l, r) => write!(f, "({} and {})", l, r),
            Expr::Or(l, r) => write!(f, "({} or {})", l, r),
            Expr::Not(e) => write!(f, "invert({})", e),
            Expr::IsNull(e) => write!(f, "is_null({})", e),
        }
    }
}

fn is_integer(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

fn is_float(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Float16 | DataType::Float32 | DataType::Float64
    )
}

/// Type both operands are cast to before a binary kernel runs.
fn common_type(left: &DataType, right: &DataType) -> ExecResult<DataType> {
    if left == right {
        return Ok(left.clone());
    }
    match (left, right) {
        (DataType::Null, other) | (other, DataType::Null) => Ok(other.clone()),
        (l, r) if (is_float(l) || is_integer(l)) && (is_float(r) || is_integer(r)) => {
            if is_float(l) || is_float(r) {
                Ok(DataType::Float64)
            } else {
                Ok(DataType::Int64)
            }
        }
        _ => Err(ExecError::invalid_options(format!(
            "no common type for {} and {}",
            left, right
        ))),
    }
}

fn coerce(array: ArrayRef, target: &DataType) -> ExecResult<ArrayRef> {
    if array.data_type() == target {
        return Ok(array);
    }
    Ok(cast(&array, target)?)
}

fn as_boolean(array: &ArrayRef, what: &Expr) -> ExecResult<BooleanArray> {
    if array.data_type() == &DataType::Null {
        return Ok(BooleanArray::from(vec![None; array.len()]));
    }
    array
        .as_boolean_opt()
        .cloned()
        .ok_or_else(|| ExecError::operator(format!("{} must evaluate to boolean", what)))
}

impl Expr {
    /// Output type of the expression over rows of `schema`.
    pub fn data_type(&self, schema: &Schema) -> ExecResult<DataType> {
        match self {
            Expr::Column(name) => schema
                .field_with_name(name)
                .map(|f| f.data_type().clone())
                .map_err(|_| {
                    ExecError::invalid_options(format!("no column named {} in input schema", name))
                }),
            Expr::Literal(value) => Ok(value.data_type()),
            Expr::Compare(_, l, r) => {
                common_type(&l.data_type(schema)?, &r.data_type(schema)?)?;
                Ok(DataType::Boolean)
            }
            Expr::Arith(_, l, r) => common_type(&l.data_type(schema)?, &r.data_type(schema)?),
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.data_type(schema)?;
                r.data_type(schema)?;
                Ok(DataType::Boolean)
            }
            Expr::Not(e) | Expr::IsNull(e) => {
                e.data_type(schema)?;
                Ok(DataType::Boolean)
            }
        }
    }

    pub fn evaluate(&self, chunk: &Chunk) -> ExecResult<ArrayRef> {
        match self {
            Expr::Column(name) => {
                let idx = chunk.schema().index_of(name).map_err(|_| {
                    ExecError::operator(format!("no column named {} in batch", name))
                })?;
                Ok(Arc::clone(&chunk.columns()[idx]))
            }
            Expr::Literal(value) => Ok(value.to_array(chunk.len())),
            Expr::Compare(op, l, r) => {
                let (l, r) = self.evaluate_pair(l, r, chunk)?;
                let out = match op {
                    CompareOp::Eq => eq(&l, &r)?,
                    CompareOp::Ne => neq(&l, &r)?,
                    CompareOp::Lt => lt(&l, &r)?,
                    CompareOp::Le => lt_eq(&l, &r)?,
                    CompareOp::Gt => gt(&l, &r)?,
                    CompareOp::Ge => gt_eq(&l, &r)?,
                };
                Ok(Arc::new(out))
            }
            Expr::Arith(op, l, r) => {
                let (l, r) = self.evaluate_pair(l, r, chunk)?;
                let out = match op {
                    ArithOp::Add => numeric::add(&l, &r)?,
                    ArithOp::Subtract => numeric::sub(&l, &r)?,
                    ArithOp::Multiply => numeric::mul(&l, &r)?,
                    ArithOp::Divide => numeric::div(&l, &r)?,
                };
                Ok(out)
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                let left = as_boolean(&l.evaluate(chunk)?, l)?;
                let right = as_boolean(&r.evaluate(chunk)?, r)?;
                let out = if matches!(self, Expr::And(..)) {
                    and_kleene(&left, &right)?
                } else {
                    or_kleene(&left, &right)?
                };
                Ok(Arc::new(out))
            }
            Expr::Not(e) => {
                let input = as_boolean(&e.evaluate(chunk)?, e)?;
                Ok(Arc::new(bool_not(&input)?))
            }
            Expr::IsNull(e) => {
                let input = e.evaluate(chunk)?;
                Ok(Arc::new(array_is_null(&input)?))
            }
        }
    }

    fn evaluate_pair(
        &self,
        l: &Expr,
        r: &Expr,
        chunk: &Chunk,
    ) -> ExecResult<(ArrayRef, ArrayRef)> {
        let left = l.evaluate(chunk)?;
        let right = r.evaluate(chunk)?;
        let target = common_type(left.data_type(), right.data_type())
            .map_err(|e| ExecError::operator(format!("{}: {}", self, e.message())))?;
        Ok((coerce(left, &target)?, coerce(right, &target)?))
    }

    /// Evaluates a predicate; null results count as false.
    pub fn evaluate_predicate(&self, chunk: &Chunk) -> ExecResult<BooleanArray> {
        let array = self.evaluate(chunk)?;
        as_boolean(&array, self)
    }
}
