mod support;

mod test_row_locked_storage;
