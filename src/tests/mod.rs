mod builder;
mod support;
