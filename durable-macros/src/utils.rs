use syn::{DeriveInput, LitStr};

// Resolve the registry name from `#[durable(name = "...")]`, falling back to the ident.
pub(crate) fn type_name(input: &DeriveInput) -> syn::Result<String> {
    let mut name = None;

    for attr in input.attrs.iter().filter(|a| a.path().is_ident("durable")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().is_empty() {
                    return Err(meta.error("durable type name cannot be empty"));
                }
                name = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported durable attribute, expected `name`"))
            }
        })?;
    }

    Ok(name.unwrap_or_else(|| input.ident.to_string()))
}
