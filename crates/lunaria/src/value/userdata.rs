// Full userdata: a host payload under GC management, with an optional
// metatable and user values.

use crate::gc::TableId;
use crate::value::LuaValue;
use std::any::Any;

pub struct Udata {
    pub data: Box<dyn Any>,
    pub metatable: Option<TableId>,
    /// User values attached at creation time (`n` slots, all start nil).
    pub user_values: Vec<LuaValue>,
}

impl Udata {
    pub fn new(data: Box<dyn Any>, nuvalues: usize) -> Self {
        Udata { data, metatable: None, user_values: vec![LuaValue::nil(); nuvalues] }
    }

    #[inline]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    #[inline]
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut::<T>()
    }
}
