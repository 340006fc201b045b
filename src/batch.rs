pub fn partition<T: Clone>(codes: &[T], batch_size: usize) -> impl Iterator<Item = Vec<T>> + '_ {
    let size = batch_size.max(1);
    codes.chunks(size).map(<[T]>::to_vec)
}
