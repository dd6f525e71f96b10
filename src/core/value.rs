//! Column types and runtime values shared by the catalog and the index
//! key encoder.

/// Column data types persisted in the catalog (`col_type` integers on
/// disk use the discriminants below).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean = 0,
    Int = 1,
    BigInt = 2,
    Float = 3,
    Varchar = 4,
}

impl DataType {
    pub fn from_i32(v: i32) -> Option<DataType> {
        match v {
            0 => Some(DataType::Boolean),
            1 => Some(DataType::Int),
            2 => Some(DataType::BigInt),
            3 => Some(DataType::Float),
            4 => Some(DataType::Varchar),
            _ => None,
        }
    }

    /// Bytes the type occupies in a record's fixed area. Variable-length
    /// columns hold a (payload-offset, payload-size) pair of u16s there.
    pub fn fixed_size(self) -> u16 {
        match self {
            DataType::Boolean => 1,
            DataType::Int => 4,
            DataType::BigInt => 8,
            DataType::Float => 4,
            DataType::Varchar => 4,
        }
    }

    pub fn is_var_length(self) -> bool {
        matches!(self, DataType::Varchar)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Varchar(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can be stored in a column of the given type.
    /// Null is acceptable for any column; nullability is checked by the
    /// schema, not here.
    pub fn matches(&self, dtype: DataType) -> bool {
        match self {
            Value::Null => true,
            Value::Boolean(_) => dtype == DataType::Boolean,
            Value::Int(_) => dtype == DataType::Int,
            Value::BigInt(_) => dtype == DataType::BigInt,
            Value::Float(_) => dtype == DataType::Float,
            Value::Varchar(_) => dtype == DataType::Varchar,
        }
    }

    /// Size of the value's payload bytes inside a record.
    pub fn payload_size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int(_) => 4,
            Value::BigInt(_) => 8,
            Value::Float(_) => 4,
            Value::Varchar(s) => s.len(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Varchar(s) => write!(f, "{s}"),
        }
    }
}
