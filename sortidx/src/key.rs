// Key capability layer. Everything the index needs from a value type is
// collected in one trait: total order, a fixed encoded width, a byte codec,
// representable-neighbor stepping and the +/- infinity sentinels used when a
// query is open on one side. The set of implementors is closed; `AnyIndex`
// dispatches over it once at the outer boundary.

use funty::Integral;
use ordered_float::OrderedFloat;
use sortidx_base::{err, ErrorKind, Result};

#[cfg(test)]
use test_log::test;

/// Which neighbor `next_after` should step to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Stay,
    Up,
}

/// Tag for the closed set of indexable value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Bytes,
}

impl KeyKind {
    pub(crate) fn code(self) -> i64 {
        match self {
            KeyKind::Bool => 0,
            KeyKind::Int8 => 1,
            KeyKind::UInt8 => 2,
            KeyKind::Int16 => 3,
            KeyKind::UInt16 => 4,
            KeyKind::Int32 => 5,
            KeyKind::UInt32 => 6,
            KeyKind::Int64 => 7,
            KeyKind::UInt64 => 8,
            KeyKind::Float32 => 9,
            KeyKind::Float64 => 10,
            KeyKind::Bytes => 11,
        }
    }

    pub(crate) fn from_code(code: i64) -> Result<KeyKind> {
        Ok(match code {
            0 => KeyKind::Bool,
            1 => KeyKind::Int8,
            2 => KeyKind::UInt8,
            3 => KeyKind::Int16,
            4 => KeyKind::UInt16,
            5 => KeyKind::Int32,
            6 => KeyKind::UInt32,
            7 => KeyKind::Int64,
            8 => KeyKind::UInt64,
            9 => KeyKind::Float32,
            10 => KeyKind::Float64,
            11 => KeyKind::Bytes,
            _ => return Err(err(ErrorKind::Unsupported, "unknown key kind code")),
        })
    }
}

/// A literal value crossing the dynamic (`AnyIndex`) boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// Capability set of an indexable value type.
pub trait IndexKey:
    Clone + Ord + std::hash::Hash + std::fmt::Debug + Send + 'static
{
    const KIND: KeyKind;

    /// Encoded width in bytes. `itemsize` only matters for byte strings.
    fn width(itemsize: usize) -> usize;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;

    /// The adjacent representable value in `dir`. Values with no neighbor in
    /// that direction (type bounds, all-`00`/all-`ff` strings, +inf upward,
    /// -inf downward, NaN) map to themselves.
    fn next_after(&self, dir: Direction, itemsize: usize) -> Self;
    fn neg_inf(itemsize: usize) -> Self;
    fn pos_inf(itemsize: usize) -> Self;

    fn is_nan(&self) -> bool {
        false
    }

    /// Widening view for overlap arithmetic; None for byte strings.
    fn to_wide(&self) -> Option<f64>;

    fn from_value(v: &Value, itemsize: usize) -> Result<Self>;
    fn to_value(&self) -> Value;
}

fn int_step<I: Integral>(x: I, dir: Direction) -> I {
    match dir {
        Direction::Stay => x,
        Direction::Up => x.saturating_add(I::ONE),
        Direction::Down => x.saturating_sub(I::ONE),
    }
}

macro_rules! int_key {
    ($t:ty, $kind:expr, $variant:ident) => {
        impl IndexKey for $t {
            const KIND: KeyKind = $kind;

            fn width(_itemsize: usize) -> usize {
                std::mem::size_of::<$t>()
            }
            fn write_to(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.to_le_bytes());
            }
            fn read_from(buf: &[u8]) -> Self {
                let mut b = [0u8; std::mem::size_of::<$t>()];
                b.copy_from_slice(buf);
                <$t>::from_le_bytes(b)
            }

            fn next_after(&self, dir: Direction, _itemsize: usize) -> Self {
                int_step(*self, dir)
            }
            fn neg_inf(_itemsize: usize) -> Self {
                <$t>::MIN
            }
            fn pos_inf(_itemsize: usize) -> Self {
                <$t>::MAX
            }

            fn to_wide(&self) -> Option<f64> {
                Some(*self as f64)
            }

            fn from_value(v: &Value, _itemsize: usize) -> Result<Self> {
                match *v {
                    Value::Int(x) => <$t>::try_from(x)
                        .map_err(|_| err(ErrorKind::BadQuery, "integer literal out of range")),
                    Value::UInt(x) => <$t>::try_from(x)
                        .map_err(|_| err(ErrorKind::BadQuery, "integer literal out of range")),
                    _ => Err(err(ErrorKind::BadQuery, "expected an integer literal")),
                }
            }
            fn to_value(&self) -> Value {
                Value::$variant((*self).into())
            }
        }
    };
}

int_key!(i8, KeyKind::Int8, Int);
int_key!(i16, KeyKind::Int16, Int);
int_key!(i32, KeyKind::Int32, Int);
int_key!(i64, KeyKind::Int64, Int);
int_key!(u8, KeyKind::UInt8, UInt);
int_key!(u16, KeyKind::UInt16, UInt);
int_key!(u32, KeyKind::UInt32, UInt);
int_key!(u64, KeyKind::UInt64, UInt);

impl IndexKey for bool {
    const KIND: KeyKind = KeyKind::Bool;

    fn width(_itemsize: usize) -> usize {
        1
    }
    fn write_to(&self, buf: &mut [u8]) {
        buf[0] = *self as u8;
    }
    fn read_from(buf: &[u8]) -> Self {
        buf[0] != 0
    }

    fn next_after(&self, dir: Direction, _itemsize: usize) -> Self {
        match dir {
            Direction::Stay => *self,
            Direction::Up => true,
            Direction::Down => false,
        }
    }
    fn neg_inf(_itemsize: usize) -> Self {
        false
    }
    fn pos_inf(_itemsize: usize) -> Self {
        true
    }

    fn to_wide(&self) -> Option<f64> {
        Some(*self as u8 as f64)
    }

    fn from_value(v: &Value, _itemsize: usize) -> Result<Self> {
        match *v {
            Value::Bool(b) => Ok(b),
            _ => Err(err(ErrorKind::BadQuery, "expected a bool literal")),
        }
    }
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

// Adjacent IEEE-754 value toward +inf, computed on the representation. The
// sign-magnitude layout keeps the mantissa in the low bits, so stepping the
// magnitude by one is a one-ulp mantissa adjustment with carry into the
// exponent field; zeros and subnormals fall out of the same arithmetic. NaN
// and +inf map to themselves, -inf steps inward to the most negative finite
// value.
fn f32_next_up(x: f32) -> f32 {
    if x.is_nan() || x == f32::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f32::from_bits(1);
    }
    let bits = x.to_bits();
    if bits >> 31 == 0 {
        f32::from_bits(bits + 1)
    } else {
        f32::from_bits(bits - 1)
    }
}

fn f64_next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if bits >> 63 == 0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

macro_rules! float_key {
    ($t:ty, $kind:expr, $next_up:ident) => {
        impl IndexKey for OrderedFloat<$t> {
            const KIND: KeyKind = $kind;

            fn width(_itemsize: usize) -> usize {
                std::mem::size_of::<$t>()
            }
            fn write_to(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.0.to_le_bytes());
            }
            fn read_from(buf: &[u8]) -> Self {
                let mut b = [0u8; std::mem::size_of::<$t>()];
                b.copy_from_slice(buf);
                OrderedFloat(<$t>::from_le_bytes(b))
            }

            fn next_after(&self, dir: Direction, _itemsize: usize) -> Self {
                match dir {
                    Direction::Stay => *self,
                    Direction::Up => OrderedFloat($next_up(self.0)),
                    Direction::Down => OrderedFloat(-$next_up(-self.0)),
                }
            }
            fn neg_inf(_itemsize: usize) -> Self {
                OrderedFloat(<$t>::NEG_INFINITY)
            }
            fn pos_inf(_itemsize: usize) -> Self {
                OrderedFloat(<$t>::INFINITY)
            }

            fn is_nan(&self) -> bool {
                self.0.is_nan()
            }
            fn to_wide(&self) -> Option<f64> {
                Some(self.0 as f64)
            }

            fn from_value(v: &Value, _itemsize: usize) -> Result<Self> {
                match *v {
                    Value::Float(x) => Ok(OrderedFloat(x as $t)),
                    Value::Int(x) => Ok(OrderedFloat(x as $t)),
                    Value::UInt(x) => Ok(OrderedFloat(x as $t)),
                    _ => Err(err(ErrorKind::BadQuery, "expected a numeric literal")),
                }
            }
            fn to_value(&self) -> Value {
                Value::Float(self.0 as f64)
            }
        }
    };
}

float_key!(f32, KeyKind::Float32, f32_next_up);
float_key!(f64, KeyKind::Float64, f64_next_up);

/// A fixed-width byte-string key. Values are stored NUL-padded to the
/// index's `itemsize`; ordering is byte-lexicographic on the padded
/// representation, never on a trimmed form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedBytes(Box<[u8]>);

impl FixedBytes {
    pub fn new(bytes: &[u8], itemsize: usize) -> Self {
        let mut v = vec![0u8; itemsize];
        let n = bytes.len().min(itemsize);
        v[..n].copy_from_slice(&bytes[..n]);
        FixedBytes(v.into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for FixedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Padding is trimmed for display only; comparisons always see it.
        let end = memchr::memchr(0, &self.0).unwrap_or(self.0.len());
        write!(f, "{:?}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl IndexKey for FixedBytes {
    const KIND: KeyKind = KeyKind::Bytes;

    fn width(itemsize: usize) -> usize {
        itemsize
    }
    fn write_to(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.0);
    }
    fn read_from(buf: &[u8]) -> Self {
        FixedBytes(buf.to_vec().into_boxed_slice())
    }

    fn next_after(&self, dir: Direction, _itemsize: usize) -> Self {
        match dir {
            Direction::Stay => self.clone(),
            Direction::Up => {
                let mut b = self.0.clone();
                for i in (0..b.len()).rev() {
                    if b[i] < 0xff {
                        b[i] += 1;
                        return FixedBytes(b);
                    }
                    b[i] = 0x00;
                }
                // All-ff saturates.
                self.clone()
            }
            Direction::Down => {
                let mut b = self.0.clone();
                for i in (0..b.len()).rev() {
                    if b[i] > 0x00 {
                        b[i] -= 1;
                        return FixedBytes(b);
                    }
                    b[i] = 0xff;
                }
                // All-00 saturates.
                self.clone()
            }
        }
    }
    fn neg_inf(itemsize: usize) -> Self {
        FixedBytes(vec![0x00; itemsize].into_boxed_slice())
    }
    fn pos_inf(itemsize: usize) -> Self {
        FixedBytes(vec![0xff; itemsize].into_boxed_slice())
    }

    fn to_wide(&self) -> Option<f64> {
        None
    }

    fn from_value(v: &Value, itemsize: usize) -> Result<Self> {
        match v {
            Value::Bytes(b) => {
                if b.len() > itemsize {
                    return Err(err(
                        ErrorKind::BadQuery,
                        "byte-string literal longer than the indexed width",
                    ));
                }
                Ok(FixedBytes::new(b, itemsize))
            }
            _ => Err(err(ErrorKind::BadQuery, "expected a byte-string literal")),
        }
    }
    fn to_value(&self) -> Value {
        Value::Bytes(self.0.to_vec())
    }
}

#[test]
fn test_int_step_saturates() {
    assert_eq!(127i8.next_after(Direction::Up, 0), 127);
    assert_eq!((-128i8).next_after(Direction::Down, 0), -128);
    assert_eq!(5i64.next_after(Direction::Up, 0), 6);
    assert_eq!(5u32.next_after(Direction::Down, 0), 4);
    assert_eq!(0u8.next_after(Direction::Down, 0), 0);
}

#[test]
fn test_float_step_involution() {
    for x in [1.0f64, -1.0, 0.5, 1e300, -1e-300, f64::MIN_POSITIVE] {
        let k = OrderedFloat(x);
        let up = k.next_after(Direction::Up, 0);
        assert!(up > k);
        assert_eq!(up.next_after(Direction::Down, 0), k);
    }
}

#[test]
fn test_float_step_edges() {
    // NaN and +inf are fixed upward; -inf steps inward to the most negative
    // finite value, +inf downward to the largest finite value.
    let nan = OrderedFloat(f64::NAN);
    assert!(nan.next_after(Direction::Up, 0).0.is_nan());
    let inf = OrderedFloat(f64::INFINITY);
    assert_eq!(inf.next_after(Direction::Up, 0), inf);
    assert_eq!(inf.next_after(Direction::Down, 0), OrderedFloat(f64::MAX));
    let ninf = OrderedFloat(f64::NEG_INFINITY);
    assert_eq!(ninf.next_after(Direction::Down, 0), ninf);
    assert_eq!(ninf.next_after(Direction::Up, 0), OrderedFloat(f64::MIN));
    // Zero steps into the subnormal range in both directions.
    let zero = OrderedFloat(0.0f64);
    assert_eq!(zero.next_after(Direction::Up, 0).0, f64::from_bits(1));
    assert_eq!(zero.next_after(Direction::Down, 0).0, -f64::from_bits(1));
}

#[test]
fn test_bytes_step() {
    let alfa = FixedBytes::new(b"alfa", 4);
    assert_eq!(alfa.next_after(Direction::Up, 4), FixedBytes::new(b"alfb", 4));
    let carry = FixedBytes::new(&[0x61, 0xff, 0xff, 0xff], 4);
    assert_eq!(
        carry.next_after(Direction::Up, 4),
        FixedBytes::new(&[0x62, 0x00, 0x00, 0x00], 4)
    );
    let top = FixedBytes::pos_inf(4);
    assert_eq!(top.next_after(Direction::Up, 4), top);
    let bottom = FixedBytes::neg_inf(4);
    assert_eq!(bottom.next_after(Direction::Down, 4), bottom);
    // Predecessor of "b\x00..." borrows down into 0xff padding.
    let b = FixedBytes::new(b"b", 4);
    assert_eq!(
        b.next_after(Direction::Down, 4),
        FixedBytes::new(&[0x61, 0xff, 0xff, 0xff], 4)
    );
}

#[test]
fn test_padded_comparison() {
    // Comparison happens on the padded representation.
    let short = FixedBytes::new(b"0", 5);
    let longer = FixedBytes::new(&[0x30, 0, 0, 0, 1], 5);
    assert!(short < longer);
}
