//! Arithmetic expression trees over handles.
//!
//! `+`, `-`, `*`, `/` on handle references build a symbolic [`Expr`] tree
//! whose leaves are other trees, handles, or constants. Folding the tree
//! into a computed cell is [`expr_cell`](crate::api::expr_cell): every
//! leaf handle read during the fold registers in the capture sink and
//! becomes a dependency.
//!
//! All leaves of one tree share a single value type; heterogeneous
//! arithmetic goes through `calc` instead.
//!
//! # Example
//!
//! ```ignore
//! let a = var(2.0);
//! let b = var(3.0);
//! let ds = expr_cell(&a + &b * 2.0);
//! assert_eq!(ds.get(), 8.0);
//! ```

use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

use crate::handle::{CellValue, Handle};

/// A symbolic arithmetic tree. Cheap to clone; sub-trees can be reused in
/// several larger expressions.
pub struct Expr<T> {
    eval: Rc<dyn Fn() -> T>,
}

impl<T: CellValue> Expr<T> {
    /// A constant leaf.
    pub fn constant(value: T) -> Self {
        Self {
            eval: Rc::new(move || value.clone()),
        }
    }

    /// A leaf reading a cell's current value.
    pub(crate) fn from_handle(handle: &Handle<T>) -> Self {
        let reader = handle.reader();
        Self {
            eval: Rc::new(move || reader.get()),
        }
    }

    /// Fold the tree from current leaf values.
    pub(crate) fn eval(&self) -> T {
        (self.eval)()
    }
}

/// A constant leaf, for expressions that start with a literal:
/// `val(2.0) * &a + &b`.
pub fn val<T: CellValue>(value: T) -> Expr<T> {
    Expr::constant(value)
}

impl<T> Clone for Expr<T> {
    fn clone(&self) -> Self {
        Self {
            eval: self.eval.clone(),
        }
    }
}

impl<T: CellValue> From<&Handle<T>> for Expr<T> {
    fn from(handle: &Handle<T>) -> Self {
        Expr::from_handle(handle)
    }
}

macro_rules! impl_expr_op {
    ($binop:ident, $method:ident) => {
        impl<T> $binop for Expr<T>
        where
            T: CellValue + $binop<Output = T>,
        {
            type Output = Expr<T>;
            fn $method(self, rhs: Expr<T>) -> Expr<T> {
                let (l, r) = (self.eval, rhs.eval);
                Expr {
                    eval: Rc::new(move || l().$method(r())),
                }
            }
        }

        impl<'a, T> $binop<&'a Handle<T>> for Expr<T>
        where
            T: CellValue + $binop<Output = T>,
        {
            type Output = Expr<T>;
            fn $method(self, rhs: &Handle<T>) -> Expr<T> {
                self.$method(Expr::from_handle(rhs))
            }
        }

        impl<'a, T> $binop<Expr<T>> for &'a Handle<T>
        where
            T: CellValue + $binop<Output = T>,
        {
            type Output = Expr<T>;
            fn $method(self, rhs: Expr<T>) -> Expr<T> {
                Expr::from_handle(self).$method(rhs)
            }
        }

        impl<'a, 'b, T> $binop<&'b Handle<T>> for &'a Handle<T>
        where
            T: CellValue + $binop<Output = T>,
        {
            type Output = Expr<T>;
            fn $method(self, rhs: &Handle<T>) -> Expr<T> {
                Expr::from_handle(self).$method(Expr::from_handle(rhs))
            }
        }

        impl<T> $binop<T> for Expr<T>
        where
            T: CellValue + $binop<Output = T>,
        {
            type Output = Expr<T>;
            fn $method(self, rhs: T) -> Expr<T> {
                self.$method(Expr::constant(rhs))
            }
        }

        impl<'a, T> $binop<T> for &'a Handle<T>
        where
            T: CellValue + $binop<Output = T>,
        {
            type Output = Expr<T>;
            fn $method(self, rhs: T) -> Expr<T> {
                Expr::from_handle(self).$method(Expr::constant(rhs))
            }
        }
    };
}

impl_expr_op!(Add, add);
impl_expr_op!(Sub, sub);
impl_expr_op!(Mul, mul);
impl_expr_op!(Div, div);
