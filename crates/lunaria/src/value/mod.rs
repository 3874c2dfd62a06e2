// Value model: the 16-byte tagged value, the hybrid table, prototypes,
// userdata, and numeric conversions.

pub mod convert;
pub mod proto;
pub mod table;
pub mod tvalue;
pub mod userdata;

pub use convert::{F2IMode, Number};
pub use proto::{AbsLineInfo, LocVar, Proto, UpvalDesc};
pub use table::{LuaTable, TableError};
pub use tvalue::{LuaValue, raw_equal, type_name_of};
pub use userdata::Udata;
