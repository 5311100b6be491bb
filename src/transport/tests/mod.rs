mod test_codec;
mod test_tcp;
