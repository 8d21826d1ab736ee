//! Simplification rules over expression classes.
//!
//! Rules are tried in a fixed order and the first match wins:
//!
//! 1. constant folding with full 256-bit semantics;
//! 2. identities and annihilators involving one known constant;
//! 3. operations of an expression with itself;
//! 4. combinations of logical operations;
//! 5. shifts out of range, power-of-two modulus and redundant address masks;
//! 6. double negation of boolean results;
//! 7. collecting constants of associative operations;
//! 8. moving constants across subtractions.
//!
//! Commutative operations are retried with swapped operands by the caller.

use super::{ClassId, ExpressionClasses};
use crate::Instruction;
use alloy_primitives::{I256, U256};

/// The result of a matched rule, rebuilt into a class by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Template {
    /// An already existing class.
    Class(ClassId),
    /// A constant.
    Constant(U256),
    /// An operation over further templates.
    Op(Instruction, Vec<Template>),
}

use Instruction as I;
use Template::{Class, Constant, Op};

/// Tries to simplify `instruction(arguments...)`.
pub(crate) fn simplify(
    classes: &ExpressionClasses,
    instruction: Instruction,
    arguments: &[ClassId],
) -> Option<Template> {
    let constants: Option<Vec<U256>> =
        arguments.iter().map(|&argument| classes.known_constant(argument)).collect();
    if let Some(constants) = constants
        && let Some(value) = fold(instruction, &constants)
    {
        return Some(Constant(value));
    }

    let rules = Rules { classes };
    match *arguments {
        [x] => rules.unary(instruction, x),
        [x, y] => rules.binary(instruction, x, y),
        _ => None,
    }
}

/// Evaluates an instruction on constant operands.
pub(crate) fn fold(instruction: Instruction, args: &[U256]) -> Option<U256> {
    let bool_value = |b: bool| U256::from(u8::from(b));
    Some(match (instruction, args) {
        (I::ADD, &[a, b]) => a.wrapping_add(b),
        (I::MUL, &[a, b]) => a.wrapping_mul(b),
        (I::SUB, &[a, b]) => a.wrapping_sub(b),
        (I::DIV, &[a, b]) => a.checked_div(b).unwrap_or_default(),
        (I::SDIV, &[a, b]) => {
            if b.is_zero() {
                U256::ZERO
            } else {
                signed(a).wrapping_div(signed(b)).into_raw()
            }
        }
        (I::MOD, &[a, b]) => a.checked_rem(b).unwrap_or_default(),
        (I::SMOD, &[a, b]) => {
            if b.is_zero() {
                U256::ZERO
            } else {
                signed(a).wrapping_rem(signed(b)).into_raw()
            }
        }
        (I::EXP, &[a, b]) => a.wrapping_pow(b),
        (I::NOT, &[a]) => !a,
        (I::LT, &[a, b]) => bool_value(a < b),
        (I::GT, &[a, b]) => bool_value(a > b),
        (I::SLT, &[a, b]) => bool_value(signed(a) < signed(b)),
        (I::SGT, &[a, b]) => bool_value(signed(a) > signed(b)),
        (I::EQ, &[a, b]) => bool_value(a == b),
        (I::ISZERO, &[a]) => bool_value(a.is_zero()),
        (I::AND, &[a, b]) => a & b,
        (I::OR, &[a, b]) => a | b,
        (I::XOR, &[a, b]) => a ^ b,
        (I::BYTE, &[a, b]) => {
            if a >= U256::from(32) {
                U256::ZERO
            } else {
                U256::from(b.byte(31 - a.to::<usize>()))
            }
        }
        (I::ADDMOD, &[a, b, c]) => {
            if c.is_zero() {
                U256::ZERO
            } else {
                a.add_mod(b, c)
            }
        }
        (I::MULMOD, &[a, b, c]) => {
            if c.is_zero() {
                U256::ZERO
            } else {
                a.mul_mod(b, c)
            }
        }
        (I::SIGNEXTEND, &[a, b]) => {
            if a >= U256::from(31) {
                b
            } else {
                let test_bit = a.to::<usize>() * 8 + 7;
                let mask = (U256::from(1) << test_bit) - U256::from(1);
                if b.bit(test_bit) { b | !mask } else { b & mask }
            }
        }
        (I::SHL, &[a, b]) => {
            if a > U256::from(255) {
                U256::ZERO
            } else {
                b << a.to::<usize>()
            }
        }
        (I::SHR, &[a, b]) => {
            if a > U256::from(255) {
                U256::ZERO
            } else {
                b >> a.to::<usize>()
            }
        }
        (I::SAR, &[a, b]) => {
            let value = signed(b);
            if a > U256::from(255) {
                if value.is_negative() { U256::MAX } else { U256::ZERO }
            } else {
                value.asr(a.to::<usize>()).into_raw()
            }
        }
        _ => return None,
    })
}

fn signed(value: U256) -> I256 {
    I256::from_raw(value)
}

fn address_mask() -> U256 {
    (U256::from(1) << 160) - U256::from(1)
}

struct Rules<'a> {
    classes: &'a ExpressionClasses,
}

impl Rules<'_> {
    fn constant(&self, id: ClassId) -> Option<U256> {
        self.classes.known_constant(id)
    }

    fn operation(&self, id: ClassId) -> Option<(Instruction, &[ClassId])> {
        let expr = self.classes.representative(id);
        expr.item.instruction().map(|instruction| (instruction, &expr.arguments[..]))
    }

    fn is_operation(&self, id: ClassId, instruction: Instruction) -> bool {
        self.operation(id).is_some_and(|(op, _)| op == instruction)
    }

    /// Matches `instruction(X, A)` or `instruction(A, X)` with a constant `A`.
    fn with_constant(&self, id: ClassId, instruction: Instruction) -> Option<(ClassId, U256)> {
        match self.operation(id)? {
            (op, &[x, a]) if op == instruction => {
                if let Some(a) = self.constant(a) {
                    Some((x, a))
                } else {
                    self.constant(x).map(|value| (a, value))
                }
            }
            _ => None,
        }
    }

    fn unary(&self, instruction: Instruction, x: ClassId) -> Option<Template> {
        match (instruction, self.operation(x)?) {
            (I::NOT, (I::NOT, &[inner])) => Some(Class(inner)),
            (I::ISZERO, (I::ISZERO, &[inner])) => match self.operation(inner)? {
                (I::EQ | I::LT | I::SLT | I::GT | I::SGT | I::ISZERO, _) => Some(Class(inner)),
                _ => None,
            },
            (I::ISZERO, (I::XOR, &[a, b])) => Some(Op(I::EQ, vec![Class(a), Class(b)])),
            _ => None,
        }
    }

    fn binary(&self, instruction: Instruction, x: ClassId, y: ClassId) -> Option<Template> {
        self.identities(instruction, x, y)
            .or_else(|| self.self_operations(instruction, x, y))
            .or_else(|| self.logical(instruction, x, y))
            .or_else(|| self.ranges(instruction, x, y))
            .or_else(|| self.associativity(instruction, x, y))
            .or_else(|| self.subtraction(instruction, x, y))
    }

    fn identities(&self, instruction: Instruction, x: ClassId, y: ClassId) -> Option<Template> {
        let (cx, cy) = (self.constant(x), self.constant(y));
        let zero = Some(U256::ZERO);
        let one = Some(U256::from(1));
        let ones = Some(U256::MAX);
        let negate = |id| Op(I::SUB, vec![Constant(U256::ZERO), Class(id)]);
        let double_negation = |id| Op(I::ISZERO, vec![Op(I::ISZERO, vec![Class(id)])]);
        Some(match instruction {
            I::ADD if cy == zero => Class(x),
            I::ADD if cx == zero => Class(y),
            I::SUB if cy == zero => Class(x),
            I::MUL if cy == zero || cx == zero => Constant(U256::ZERO),
            I::MUL if cy == one => Class(x),
            I::MUL if cx == one => Class(y),
            I::MUL if cy == ones => negate(x),
            I::MUL if cx == ones => negate(y),
            I::DIV | I::SDIV if cy == zero || cx == zero => Constant(U256::ZERO),
            I::DIV | I::SDIV if cy == one => Class(x),
            I::AND if cy == ones => Class(x),
            I::AND if cx == ones => Class(y),
            I::AND if cy == zero || cx == zero => Constant(U256::ZERO),
            I::OR if cy == zero => Class(x),
            I::OR if cx == zero => Class(y),
            I::OR if cy == ones || cx == ones => Constant(U256::MAX),
            I::XOR if cy == zero => Class(x),
            I::XOR if cx == zero => Class(y),
            I::MOD if cy == zero || cx == zero => Constant(U256::ZERO),
            I::EQ if cy == zero => Op(I::ISZERO, vec![Class(x)]),
            I::EQ if cx == zero => Op(I::ISZERO, vec![Class(y)]),
            I::SHL | I::SHR if cx == zero => Class(y),
            I::SHL | I::SHR if cy == zero => Constant(U256::ZERO),
            I::GT if cy == zero => double_negation(x),
            I::LT if cx == zero => double_negation(y),
            I::GT if cy == ones || cx == zero => Constant(U256::ZERO),
            I::LT if cx == ones || cy == zero => Constant(U256::ZERO),
            I::AND if cy == Some(U256::from(0xff)) && self.is_operation(x, I::BYTE) => Class(x),
            I::BYTE if cx == Some(U256::from(31)) => {
                Op(I::AND, vec![Class(y), Constant(U256::from(0xff))])
            }
            _ => return None,
        })
    }

    fn self_operations(
        &self,
        instruction: Instruction,
        x: ClassId,
        y: ClassId,
    ) -> Option<Template> {
        if x != y {
            return None;
        }
        Some(match instruction {
            I::AND | I::OR => Class(x),
            I::EQ => Constant(U256::from(1)),
            I::XOR | I::SUB | I::LT | I::SLT | I::GT | I::SGT | I::MOD => Constant(U256::ZERO),
            _ => return None,
        })
    }

    fn logical(&self, instruction: Instruction, x: ClassId, y: ClassId) -> Option<Template> {
        let (inner, args) = self.operation(y)?;
        // The operand of `y` other than `x`, if `x` is one of them.
        let other = match *args {
            [a, b] if a == x => Some(b),
            [a, b] if b == x => Some(a),
            _ => None,
        };
        match (instruction, inner, args) {
            // X ^ (X ^ Y) -> Y
            (I::XOR, I::XOR, _) => other.map(Class),
            // X | (X & Y) -> X
            (I::OR, I::AND, _) | (I::AND, I::OR, _) => other.map(|_| Class(x)),
            (I::AND, I::NOT, &[z]) if z == x => Some(Constant(U256::ZERO)),
            (I::OR, I::NOT, &[z]) if z == x => Some(Constant(U256::MAX)),
            _ => None,
        }
    }

    fn ranges(&self, instruction: Instruction, x: ClassId, y: ClassId) -> Option<Template> {
        let (cx, cy) = (self.constant(x), self.constant(y));
        let out_of_range = cx.is_some_and(|shift| shift >= U256::from(256));
        Some(match instruction {
            I::MOD if cy.is_some_and(|modulus| modulus.is_power_of_two()) => {
                let modulus = cy?;
                Op(I::AND, vec![Class(x), Constant(modulus - U256::from(1))])
            }
            I::SHL | I::SHR if out_of_range => Constant(U256::ZERO),
            I::SAR if out_of_range => Op(I::SAR, vec![Constant(U256::from(255)), Class(y)]),
            I::AND if cy == Some(address_mask()) => match self.operation(x)? {
                (
                    I::ADDRESS | I::CALLER | I::ORIGIN | I::COINBASE | I::CREATE | I::CREATE2,
                    _,
                ) => Class(x),
                _ => return None,
            },
            _ => return None,
        })
    }

    fn associativity(&self, instruction: Instruction, x: ClassId, y: ClassId) -> Option<Template> {
        let combine = |a: U256, b: U256| -> Option<U256> {
            Some(match instruction {
                I::ADD => a.wrapping_add(b),
                I::MUL => a.wrapping_mul(b),
                I::AND => a & b,
                I::OR => a | b,
                I::XOR => a ^ b,
                _ => return None,
            })
        };
        // Fails early for non-associative instructions.
        combine(U256::ZERO, U256::ZERO)?;

        let op = |args| Op(instruction, args);
        if let Some((inner, a)) = self.with_constant(x, instruction) {
            // (X + A) + B -> X + (A + B)
            if let Some(b) = self.constant(y) {
                return Some(op(vec![Class(inner), Constant(combine(a, b)?)]));
            }
            // (X + A) + Y -> (X + Y) + A
            return Some(op(vec![op(vec![Class(inner), Class(y)]), Constant(a)]));
        }
        if let Some((inner, a)) = self.with_constant(y, instruction) {
            // B + (X + A) -> X + (A + B)
            if let Some(b) = self.constant(x) {
                return Some(op(vec![Class(inner), Constant(combine(a, b)?)]));
            }
            // Y + (X + A) -> (Y + X) + A
            return Some(op(vec![op(vec![Class(x), Class(inner)]), Constant(a)]));
        }
        None
    }

    fn subtraction(&self, instruction: Instruction, x: ClassId, y: ClassId) -> Option<Template> {
        if instruction != I::SUB {
            return None;
        }
        // X - A -> X + (-A)
        if let Some(a) = self.constant(y) {
            return Some(Op(I::ADD, vec![Class(x), Constant(U256::ZERO.wrapping_sub(a))]));
        }
        let difference = |a, b| Op(I::SUB, vec![Class(a), Class(b)]);
        // (X + A) - Y -> (X - Y) + A
        if let Some((inner, a)) = self.with_constant(x, I::ADD) {
            return Some(Op(I::ADD, vec![difference(inner, y), Constant(a)]));
        }
        // X - (Y + A) -> (X - Y) + (-A)
        if let Some((inner, a)) = self.with_constant(y, I::ADD) {
            return Some(Op(
                I::ADD,
                vec![difference(x, inner), Constant(U256::ZERO.wrapping_sub(a))],
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceLocation;

    fn u(value: u64) -> U256 {
        U256::from(value)
    }

    #[test]
    fn test_fold_arithmetic() {
        assert_eq!(fold(I::ADD, &[U256::MAX, u(2)]), Some(u(1)));
        assert_eq!(fold(I::SUB, &[u(0), u(1)]), Some(U256::MAX));
        assert_eq!(fold(I::DIV, &[u(7), u(0)]), Some(u(0)));
        assert_eq!(fold(I::MOD, &[u(7), u(3)]), Some(u(1)));
        assert_eq!(fold(I::EXP, &[u(2), u(256)]), Some(u(0)));
        assert_eq!(fold(I::EXP, &[u(3), u(4)]), Some(u(81)));
        assert_eq!(fold(I::ADDMOD, &[U256::MAX, u(2), u(10)]), Some(u(7)));
        assert_eq!(fold(I::MULMOD, &[u(3), u(4), u(0)]), Some(u(0)));
    }

    #[test]
    fn test_fold_signed() {
        let minus_one = U256::MAX;
        let minus_six = U256::ZERO.wrapping_sub(u(6));
        assert_eq!(fold(I::SDIV, &[minus_six, u(2)]), Some(U256::ZERO.wrapping_sub(u(3))));
        assert_eq!(fold(I::SMOD, &[minus_six, u(4)]), Some(U256::ZERO.wrapping_sub(u(2))));
        assert_eq!(fold(I::SLT, &[minus_one, u(0)]), Some(u(1)));
        assert_eq!(fold(I::SGT, &[minus_one, u(0)]), Some(u(0)));
        assert_eq!(fold(I::SIGNEXTEND, &[u(0), u(0xff)]), Some(U256::MAX));
        assert_eq!(fold(I::SIGNEXTEND, &[u(0), u(0x17f)]), Some(u(0x7f)));
    }

    #[test]
    fn test_fold_bits() {
        assert_eq!(fold(I::BYTE, &[u(31), u(0x1234)]), Some(u(0x34)));
        assert_eq!(fold(I::BYTE, &[u(30), u(0x1234)]), Some(u(0x12)));
        assert_eq!(fold(I::BYTE, &[u(32), u(0x1234)]), Some(u(0)));
        assert_eq!(fold(I::SHL, &[u(8), u(1)]), Some(u(0x100)));
        assert_eq!(fold(I::SHL, &[u(256), u(1)]), Some(u(0)));
        assert_eq!(fold(I::SHR, &[u(4), u(0x100)]), Some(u(0x10)));
        assert_eq!(fold(I::SAR, &[u(300), U256::MAX]), Some(U256::MAX));
        assert_eq!(fold(I::SAR, &[u(4), U256::MAX]), Some(U256::MAX));
        assert_eq!(fold(I::NOT, &[u(0)]), Some(U256::MAX));
        assert_eq!(fold(I::CALLER, &[]), None);
    }

    #[test]
    fn test_identities() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(I::CALLER, &[]);
        let zero = classes.find_constant(U256::ZERO);
        let one = classes.find_constant(u(1));
        assert_eq!(classes.find_op(I::ADD, &[x, zero]), x);
        assert_eq!(classes.find_op(I::MUL, &[one, x]), x);
        assert_eq!(classes.find_op(I::SUB, &[x, x]), zero);
        assert_eq!(classes.find_op(I::OR, &[x, x]), x);
        let not_x = classes.find_op(I::NOT, &[x]);
        assert_eq!(classes.find_op(I::NOT, &[not_x]), x);
        let mask = classes.find_constant(address_mask());
        assert_eq!(classes.find_op(I::AND, &[x, mask]), x);
    }

    #[test]
    fn test_address_mask_kept_for_arbitrary_values() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(I::CALLVALUE, &[]);
        let mask = classes.find_constant(address_mask());
        assert_ne!(classes.find_op(I::AND, &[x, mask]), x);
    }

    #[test]
    fn test_double_negation() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(I::CALLER, &[]);
        let y = classes.find_op(I::CALLVALUE, &[]);
        let lt = classes.find_op(I::LT, &[x, y]);
        let not_lt = classes.find_op(I::ISZERO, &[lt]);
        assert_eq!(classes.find_op(I::ISZERO, &[not_lt]), lt);
        let not_x = classes.find_op(I::ISZERO, &[x]);
        let not_not_x = classes.find_op(I::ISZERO, &[not_x]);
        assert_ne!(not_not_x, x);
        assert_eq!(classes.find_op(I::ISZERO, &[not_not_x]), not_x);
    }

    #[test]
    fn test_constant_collection() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(I::CALLER, &[]);
        let two = classes.find_constant(u(2));
        let three = classes.find_constant(u(3));
        let x_plus_2 = classes.find_op(I::ADD, &[x, two]);
        let result = classes.find_op(I::ADD, &[x_plus_2, three]);
        let five = classes.find_constant(u(5));
        assert_eq!(result, classes.find_op(I::ADD, &[x, five]));
    }

    #[test]
    fn test_subtraction_canonical_form() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(I::CALLER, &[]);
        let two = classes.find_constant(u(2));
        let difference = classes.find_op(I::SUB, &[x, two]);
        let minus_two = classes.find_constant(U256::ZERO.wrapping_sub(u(2)));
        assert_eq!(difference, classes.find_op(I::ADD, &[x, minus_two]));
    }

    #[test]
    fn test_shift_out_of_range() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(I::CALLER, &[]);
        let shift = classes.find_constant(u(256));
        let zero = classes.find_constant(U256::ZERO);
        assert_eq!(classes.find_op(I::SHL, &[shift, x]), zero);
        assert_eq!(classes.find_op(I::SHR, &[shift, x]), zero);
        let sar = classes.find_op(I::SAR, &[shift, x]);
        let max_shift = classes.find_constant(u(255));
        assert_eq!(sar, classes.find_op(I::SAR, &[max_shift, x]));
        let unique = classes.new_class(SourceLocation::default());
        assert_ne!(sar, unique);
    }
}
