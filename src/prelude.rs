// SPDX-License-Identifier: MPL-2.0

#![allow(unused_imports)]

pub(crate) use alloc::{
    collections::{BTreeMap, BTreeSet},
    string::{String, ToString},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};

pub(crate) use align_ext::AlignExt;
pub(crate) use log::{debug, error, info, trace, warn};
pub(crate) use spin::{Mutex, MutexGuard};

pub(crate) use crate::{
    error::{Errno, Error},
    range::{PAGE_MASK, PAGE_SIZE},
    return_errno, return_errno_with_msg, Result,
};
