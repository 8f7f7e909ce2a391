/// Static labels generated by the `#[transaction]` macro.
#[derive(Copy, Clone, Debug)]
pub struct TransactionLabels {
    pub metric: &'static str,
    pub tags: &'static [(&'static str, &'static str)],
}
