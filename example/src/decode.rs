use pgpoll::{Array, Connection, Encode, Format, Result, types::Json};
use serde::Deserialize;
use time::PrimitiveDateTime;

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct Foo {
    id: i32,
}

pub fn main() -> Result<()> {
    let mut conn = Connection::connect_env()?;

    // binary array round-trip
    let param = vec![Some(1i32), Some(2), None, Some(4)].encode();
    let result = conn.exec_params("SELECT $1::int[]", &[param], Format::Binary)?;
    let array = result.answer()?.get::<Array>(0, 0)?;
    assert_eq!(array.dims().len(), 1);
    assert!(array.is_null(&[2])?);
    assert_eq!(array.get::<i32>(&[3])?, 4);

    // text array literal
    let result = conn.exec(r#"SELECT '{{"a b",NULL},{"NULL",c}}'::text[]"#)?;
    let array = result.answer()?.get::<Array>(0, 0)?;
    assert_eq!(array.get::<&str>(&[0, 0])?, "a b");
    assert!(array.is_null(&[0, 1])?);
    assert_eq!(array.get::<&str>(&[1, 0])?, "NULL");

    let result = conn.exec("SELECT NULL::text, now()::timestamp, '{\"id\":420}'::jsonb")?;
    let answer = result.answer()?;
    assert!(answer.get::<Option<String>>(0, 0)?.is_none());
    let now = answer.get::<PrimitiveDateTime>(0, 1)?;
    tracing::info!(%now);
    let Json(foo) = answer.get::<Json<Foo>>(0, 2)?;
    assert_eq!(foo, Foo { id: 420 });

    Ok(())
}
