//! Gate expressions.
//!
//! A gate is a side-effect-free boolean expression over attributes
//! published by other units. The scheduler evaluates a unit's gates each
//! time the unit is reached in a pass.

use std::ops::{BitAnd, BitOr, Not};

use crate::attr::{Attr, AttrRef};

/// A numeric attribute a gate can compare.
#[derive(Debug, Clone)]
pub enum NumRef {
    U32(AttrRef<u32>),
    U64(AttrRef<u64>),
    Usize(AttrRef<usize>),
    F32(AttrRef<f32>),
    F64(AttrRef<f64>),
}

impl NumRef {
    pub fn value(&self) -> f64 {
        match self {
            Self::U32(a) => f64::from(a.get()),
            Self::U64(a) => a.get() as f64,
            Self::Usize(a) => a.get() as f64,
            Self::F32(a) => f64::from(a.get()),
            Self::F64(a) => a.get(),
        }
    }
}

macro_rules! num_ref_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<AttrRef<$ty>> for NumRef {
                fn from(attr: AttrRef<$ty>) -> Self {
                    Self::$variant(attr)
                }
            }

            impl From<&Attr<$ty>> for NumRef {
                fn from(attr: &Attr<$ty>) -> Self {
                    Self::$variant(attr.share())
                }
            }
        )*
    };
}

num_ref_from!(u32 => U32, u64 => U64, usize => Usize, f32 => F32, f64 => F64);

/// Boolean expression deciding whether a unit runs.
#[derive(Debug, Clone, Default)]
pub enum Gate {
    #[default]
    Open,
    Closed,
    Flag(AttrRef<bool>),
    /// `value >= threshold`
    AtLeast(NumRef, f64),
    /// `value < threshold`
    Below(NumRef, f64),
    Not(Box<Gate>),
    All(Vec<Gate>),
    Any(Vec<Gate>),
}

impl Gate {
    pub fn flag(attr: &Attr<bool>) -> Self {
        Self::Flag(attr.share())
    }

    pub fn at_least(value: impl Into<NumRef>, threshold: f64) -> Self {
        Self::AtLeast(value.into(), threshold)
    }

    pub fn below(value: impl Into<NumRef>, threshold: f64) -> Self {
        Self::Below(value.into(), threshold)
    }

    pub fn and(self, other: Gate) -> Self {
        match self {
            Self::All(mut gates) => {
                gates.push(other);
                Self::All(gates)
            }
            gate => Self::All(vec![gate, other]),
        }
    }

    pub fn or(self, other: Gate) -> Self {
        match self {
            Self::Any(mut gates) => {
                gates.push(other);
                Self::Any(gates)
            }
            gate => Self::Any(vec![gate, other]),
        }
    }

    pub fn evaluate(&self) -> bool {
        match self {
            Self::Open => true,
            Self::Closed => false,
            Self::Flag(flag) => flag.get(),
            Self::AtLeast(value, threshold) => value.value() >= *threshold,
            Self::Below(value, threshold) => value.value() < *threshold,
            Self::Not(gate) => !gate.evaluate(),
            Self::All(gates) => gates.iter().all(Gate::evaluate),
            Self::Any(gates) => gates.iter().any(Gate::evaluate),
        }
    }
}

impl Not for Gate {
    type Output = Gate;

    fn not(self) -> Gate {
        match self {
            Self::Not(inner) => *inner,
            Self::Open => Self::Closed,
            Self::Closed => Self::Open,
            gate => Self::Not(Box::new(gate)),
        }
    }
}

impl BitAnd for Gate {
    type Output = Gate;

    fn bitand(self, rhs: Gate) -> Gate {
        self.and(rhs)
    }
}

impl BitOr for Gate {
    type Output = Gate;

    fn bitor(self, rhs: Gate) -> Gate {
        self.or(rhs)
    }
}
