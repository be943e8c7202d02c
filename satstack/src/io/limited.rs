use super::Readable;

/// A byte-budgeted view of another reader.
///
/// Each dispatch layer hands the next layer a `LimitedRead` covering only
/// its payload, so handlers cannot read past their own frame. Finalizing a
/// `LimitedRead` consumes the rest of the budget from the parent but does
/// not finalize the parent's packet.
pub struct LimitedRead<'a> {
    src: &'a mut dyn Readable,
    rem: usize,
}

impl<'a> LimitedRead<'a> {
    /// View at most `limit` bytes of `src`.
    pub fn new(src: &'a mut dyn Readable, limit: usize) -> Self {
        LimitedRead { src, rem: limit }
    }

    /// View everything currently ready on `src`.
    pub fn remainder(src: &'a mut dyn Readable) -> Self {
        let rem = src.get_read_ready();
        LimitedRead { src, rem }
    }
}

impl Readable for LimitedRead<'_> {
    fn get_read_ready(&self) -> usize {
        self.rem.min(self.src.get_read_ready())
    }

    fn read_next(&mut self) -> u8 {
        self.rem -= 1;
        self.src.read_next()
    }

    fn read_finalize(&mut self) {
        while self.rem > 0 && self.src.get_read_ready() > 0 {
            self.src.read_next();
            self.rem -= 1;
        }
        self.rem = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ArrayRead;

    #[test]
    fn budget_is_enforced() {
        let data = [1, 2, 3, 4, 5, 6];
        let mut rd = ArrayRead::new(&data);
        let mut lim = LimitedRead::new(&mut rd, 4);
        assert_eq!(lim.get_read_ready(), 4);
        assert_eq!(lim.read_u32(), Some(0x01020304));
        assert_eq!(lim.read_u8(), None);
        lim.read_finalize();
        // Parent keeps the bytes beyond the budget.
        assert_eq!(rd.read_u16(), Some(0x0506));
    }

    #[test]
    fn finalize_consumes_budget_only() {
        let data = [1, 2, 3, 4, 5];
        let mut rd = ArrayRead::new(&data);
        let mut lim = LimitedRead::new(&mut rd, 3);
        assert_eq!(lim.read_u8(), Some(1));
        lim.read_finalize();
        assert_eq!(rd.get_read_ready(), 2);
    }

    #[test]
    fn nested_views() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut rd = ArrayRead::new(&data);
        let mut outer = LimitedRead::new(&mut rd, 6);
        assert_eq!(outer.read_u8(), Some(1));
        let mut inner = LimitedRead::new(&mut outer, 2);
        assert_eq!(inner.read_u16(), Some(0x0203));
        assert_eq!(inner.get_read_ready(), 0);
        drop(inner);
        assert_eq!(outer.get_read_ready(), 3);
    }
}
