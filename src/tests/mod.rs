
mod test_common_validation;
