pub const NT_SUCCESS: fn(i32) -> bool = |status| status >= 0;

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xc0000004u32 as i32;
pub const STATUS_ACCESS_VIOLATION: i32 = 0xc0000005u32 as i32;
pub const STATUS_INVALID_HANDLE: i32 = 0xc0000008u32 as i32;
pub const STATUS_INVALID_PARAMETER: i32 = 0xc000000du32 as i32;
pub const STATUS_ACCESS_DENIED: i32 = 0xc0000022u32 as i32;
pub const STATUS_BUFFER_TOO_SMALL: i32 = 0xc0000023u32 as i32;
pub const STATUS_PARTIAL_COPY: i32 = 0x8000000du32 as i32;
pub const STATUS_NOT_FOUND: i32 = 0xc0000225u32 as i32;
