// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed capacity buffer pools for inbound SDUs and outbound ISO packets.

use std::cell::Cell;
use std::rc::Rc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::iso::config::PoolConfig;

struct PoolInner {
    name: &'static str,
    count: usize,
    buf_size: usize,
    in_use: Cell<usize>,
}

#[derive(Clone)]
pub struct BufPool {
    inner: Rc<PoolInner>,
}

/// Accounts for one buffer taken out of a pool; the buffer is returned
/// when the lease is dropped.
pub struct Lease {
    pool: Rc<PoolInner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.in_use.set(self.pool.in_use.get() - 1);
    }
}

/// A pool buffer with a bounded capacity.
pub struct PoolBuf {
    data: BytesMut,
    lease: Lease,
}

impl BufPool {
    pub fn new(name: &'static str, config: PoolConfig) -> BufPool {
        BufPool {
            inner: Rc::new(PoolInner {
                name,
                count: config.count,
                buf_size: config.buf_size,
                in_use: Cell::new(0),
            }),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    pub fn available(&self) -> usize {
        self.inner.count - self.inner.in_use.get()
    }

    pub fn alloc(&self) -> Option<PoolBuf> {
        if self.available() == 0 {
            trace!("{} pool exhausted", self.inner.name);
            return None;
        }
        self.inner.in_use.set(self.inner.in_use.get() + 1);
        Some(PoolBuf {
            data: BytesMut::with_capacity(self.inner.buf_size),
            lease: Lease { pool: self.inner.clone() },
        })
    }
}

impl PoolBuf {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn tailroom(&self) -> usize {
        self.lease.pool.buf_size - self.data.len()
    }

    /// Append `data`, failing without modification if it does not fit.
    pub fn append(&mut self, data: &[u8]) -> Result<(), usize> {
        if data.len() > self.tailroom() {
            return Err(self.tailroom());
        }
        self.data.put_slice(data);
        Ok(())
    }

    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Release the buffer back to the pool and hand out its contents.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Hand out the contents while keeping the buffer accounted for.
    pub fn into_parts(self) -> (Bytes, Lease) {
        (self.data.freeze(), self.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize, buf_size: usize) -> BufPool {
        BufPool::new("test", PoolConfig { count, buf_size })
    }

    #[test]
    fn exhaust_and_release() {
        let pool = pool(2, 8);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        drop(a);
        assert_eq!(pool.available(), 1);
        let _ = b.freeze();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn lease_outlives_contents() {
        let pool = pool(1, 8);
        let mut buf = pool.alloc().unwrap();
        buf.append(&[1, 2, 3]).unwrap();
        let (data, lease) = buf.into_parts();
        drop(data);
        assert_eq!(pool.available(), 0);
        drop(lease);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn bounded_capacity() {
        let pool = pool(1, 4);
        let mut buf = pool.alloc().unwrap();
        assert_eq!(buf.append(&[0; 3]), Ok(()));
        assert_eq!(buf.append(&[0; 2]), Err(1));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.tailroom(), 1);
    }
}
