mod address;
mod kind;
pub(crate) mod macros;
mod memory_access;
mod vcpu_id;

pub use self::{
    address::{Gfn, Hpa, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, Pa, page_count},
    kind::{HandlerKind, PageAccessState, PageType},
    memory_access::MemoryAccess,
    vcpu_id::VcpuId,
};
